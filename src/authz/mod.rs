//! Authorization/identity collaborator
//!
//! The pipeline never decides permissions itself; it asks the platform's
//! identity service before accepting writes and notifies it when playback
//! is ready. All calls carry the 30-second collaborator timeout; a timeout
//! surfaces as `UpstreamTimeout` and is never silently retried here.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::types::{PipelineError, Result};

/// A user's membership in a company, the unit permissions attach to
#[derive(Debug, Clone, Deserialize)]
pub struct CompanyUser {
    pub id: String,
    pub user_id: String,
    pub company_id: String,
}

#[async_trait]
pub trait VideoAuthz: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<serde_json::Value>;

    async fn get_company_user(&self, user_id: &str, company_id: &str) -> Result<CompanyUser>;

    async fn check_upload_permission(&self, company_user: &CompanyUser) -> Result<bool>;

    /// Whether `additional_bytes` still fits the company's storage quota
    async fn check_storage_limit(
        &self,
        company_user: &CompanyUser,
        additional_bytes: u64,
    ) -> Result<bool>;

    async fn check_video_access(&self, company_user: &CompanyUser, video_id: Uuid) -> Result<bool>;

    /// Push updated playback fields back to the platform record
    async fn update_video_metadata(
        &self,
        video_id: Uuid,
        fields: &HashMap<String, serde_json::Value>,
    ) -> Result<()>;

    async fn notify_video_ready(&self, video_id: Uuid, user_id: &str) -> Result<()>;

    async fn health(&self) -> Result<()>;
}

/// HTTP client for the identity service
pub struct HttpAuthz {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuthz {
    pub fn new(base_url: &str, service_token: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(token) = service_token {
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| PipelineError::Config(format!("invalid service token: {}", e)))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| PipelineError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn map_err(context: &str, err: reqwest::Error) -> PipelineError {
        if err.is_timeout() {
            PipelineError::UpstreamTimeout(format!("{}: {}", context, err))
        } else {
            PipelineError::Internal(format!("{}: {}", context, err))
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| Self::map_err(path, e))?;
        match resp.status() {
            status if status.is_success() => {
                resp.json().await.map_err(|e| Self::map_err(path, e))
            }
            reqwest::StatusCode::NOT_FOUND => Err(PipelineError::NotFound(path.to_string())),
            reqwest::StatusCode::FORBIDDEN => {
                Err(PipelineError::Forbidden(format!("denied by authz: {}", path)))
            }
            status => Err(PipelineError::Internal(format!(
                "authz returned {} for {}",
                status, path
            ))),
        }
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| Self::map_err(path, e))?;
        if !resp.status().is_success() {
            return Err(PipelineError::Internal(format!(
                "authz returned {} for {}",
                resp.status(),
                path
            )));
        }
        resp.json().await.map_err(|e| Self::map_err(path, e))
    }
}

#[derive(Debug, Deserialize)]
struct Allowed {
    allowed: bool,
}

#[async_trait]
impl VideoAuthz for HttpAuthz {
    async fn get_user(&self, user_id: &str) -> Result<serde_json::Value> {
        self.get_json(&format!("/api/users/{}/", user_id)).await
    }

    async fn get_company_user(&self, user_id: &str, company_id: &str) -> Result<CompanyUser> {
        self.get_json(&format!(
            "/api/company-users/?user={}&company={}",
            user_id, company_id
        ))
        .await
    }

    async fn check_upload_permission(&self, company_user: &CompanyUser) -> Result<bool> {
        let allowed: Allowed = self
            .get_json(&format!(
                "/api/company-users/{}/upload-permission/",
                company_user.id
            ))
            .await?;
        Ok(allowed.allowed)
    }

    async fn check_storage_limit(
        &self,
        company_user: &CompanyUser,
        additional_bytes: u64,
    ) -> Result<bool> {
        let allowed: Allowed = self
            .get_json(&format!(
                "/api/company-users/{}/storage-limit/?bytes={}",
                company_user.id, additional_bytes
            ))
            .await?;
        Ok(allowed.allowed)
    }

    async fn check_video_access(&self, company_user: &CompanyUser, video_id: Uuid) -> Result<bool> {
        let allowed: Allowed = self
            .get_json(&format!(
                "/api/company-users/{}/video-access/{}/",
                company_user.id, video_id
            ))
            .await?;
        Ok(allowed.allowed)
    }

    async fn update_video_metadata(
        &self,
        video_id: Uuid,
        fields: &HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let body = serde_json::json!({ "video_id": video_id, "fields": fields });
        self.post_json(&format!("/api/videos/{}/metadata/", video_id), &body)
            .await?;
        debug!(video_id = %video_id, "pushed metadata to platform");
        Ok(())
    }

    async fn notify_video_ready(&self, video_id: Uuid, user_id: &str) -> Result<()> {
        let body = serde_json::json!({ "video_id": video_id, "user_id": user_id });
        self.post_json(&format!("/api/videos/{}/ready/", video_id), &body)
            .await?;
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        self.get_json::<serde_json::Value>("/api/health/").await?;
        Ok(())
    }
}

/// Grants everything; for dev mode and tests.
pub struct AllowAll;

#[async_trait]
impl VideoAuthz for AllowAll {
    async fn get_user(&self, user_id: &str) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "id": user_id }))
    }

    async fn get_company_user(&self, user_id: &str, company_id: &str) -> Result<CompanyUser> {
        Ok(CompanyUser {
            id: format!("{}:{}", user_id, company_id),
            user_id: user_id.to_string(),
            company_id: company_id.to_string(),
        })
    }

    async fn check_upload_permission(&self, _company_user: &CompanyUser) -> Result<bool> {
        Ok(true)
    }

    async fn check_storage_limit(
        &self,
        _company_user: &CompanyUser,
        _additional_bytes: u64,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn check_video_access(
        &self,
        _company_user: &CompanyUser,
        _video_id: Uuid,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn update_video_metadata(
        &self,
        _video_id: Uuid,
        _fields: &HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        Ok(())
    }

    async fn notify_video_ready(&self, _video_id: Uuid, _user_id: &str) -> Result<()> {
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}
