//! Playback access and view accounting
//!
//! The call point the HTTP layer uses when a client asks to play a video:
//! access check, a presigned manifest URL, and the `video_view` event plus
//! view counters. View accounting is fire-and-forget; it never blocks or
//! fails the playback request.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::authz::VideoAuthz;
use crate::events::{publish_best_effort, EventPublisher, VideoEvent};
use crate::metrics::{MetricKey, MetricsSink};
use crate::storage::VideoStore;
use crate::types::{PipelineError, Result, VideoRecord, VideoStatus};

/// Identity of the watching user, when the request carries one
#[derive(Debug, Clone)]
pub struct Viewer {
    pub user_id: String,
    pub company_id: String,
}

pub struct PlaybackService {
    store: Arc<VideoStore>,
    authz: Arc<dyn VideoAuthz>,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<dyn MetricsSink>,
}

impl PlaybackService {
    pub fn new(
        store: Arc<VideoStore>,
        authz: Arc<dyn VideoAuthz>,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            authz,
            events,
            metrics,
        }
    }

    /// Presigned URL for the HLS master playlist; counts as a view.
    pub async fn hls_manifest_url(&self, video_id: Uuid, viewer: Option<&Viewer>) -> Result<String> {
        self.authorize_playback(video_id, viewer).await?;
        let url = self.store.presign_hls(video_id).await?;
        self.record_view(video_id, viewer).await;
        Ok(url)
    }

    /// Presigned URL for the DASH MPD; counts as a view.
    pub async fn dash_manifest_url(&self, video_id: Uuid, viewer: Option<&Viewer>) -> Result<String> {
        self.authorize_playback(video_id, viewer).await?;
        let url = self.store.presign_dash(video_id).await?;
        self.record_view(video_id, viewer).await;
        Ok(url)
    }

    /// Announce one view on the bus and bump the per-user/company counter.
    pub async fn record_view(&self, video_id: Uuid, viewer: Option<&Viewer>) {
        publish_best_effort(
            self.events.as_ref(),
            &VideoEvent::view(
                video_id,
                viewer.map(|v| v.user_id.as_str()),
                viewer.map(|v| v.company_id.as_str()),
            ),
        )
        .await;
        self.metrics
            .incr(
                "video_views",
                1,
                MetricKey {
                    user_id: viewer.map(|v| v.user_id.as_str()),
                    company_id: viewer.map(|v| v.company_id.as_str()),
                    video_id: Some(video_id),
                },
            )
            .await;
        info!(video_id = %video_id, "recorded view");
    }

    async fn authorize_playback(
        &self,
        video_id: Uuid,
        viewer: Option<&Viewer>,
    ) -> Result<VideoRecord> {
        let record = match self.store.get_metadata(video_id).await {
            Ok(record) => record,
            Err(PipelineError::NotFound(_)) => {
                return Err(PipelineError::VideoNotFound(video_id.to_string()))
            }
            Err(e) => return Err(e),
        };
        if record.status != VideoStatus::Ready {
            return Err(PipelineError::Conflict(format!(
                "video {} is {} and not yet playable",
                video_id, record.status
            )));
        }
        if let Some(viewer) = viewer {
            let company_user = self
                .authz
                .get_company_user(&viewer.user_id, &viewer.company_id)
                .await?;
            if !self.authz.check_video_access(&company_user, video_id).await? {
                return Err(PipelineError::Forbidden(
                    "viewer may not access this video".to_string(),
                ));
            }
        }
        Ok(record)
    }
}
