//! S3-compatible backend
//!
//! Two buckets (raw and processed). Compose uses a multipart upload whose
//! parts are server-side copies of the source objects, so chunk assembly
//! never round-trips the payload through this process.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::{debug, warn};

use super::{Bucket, Listing, ObjectStore};
use crate::types::{PipelineError, Result};

pub struct S3Store {
    client: Client,
    raw_bucket: String,
    processed_bucket: String,
}

impl S3Store {
    pub async fn new(
        raw_bucket: &str,
        processed_bucket: &str,
        endpoint_url: Option<&str>,
        force_path_style: bool,
    ) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if force_path_style {
            builder = builder.force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        debug!(raw = raw_bucket, processed = processed_bucket, "initialized s3 object store");
        Ok(Self {
            client,
            raw_bucket: raw_bucket.to_string(),
            processed_bucket: processed_bucket.to_string(),
        })
    }

    fn bucket_name(&self, bucket: Bucket) -> &str {
        match bucket {
            Bucket::Raw => &self.raw_bucket,
            Bucket::Processed => &self.processed_bucket,
        }
    }

    fn unavailable(context: &str, err: impl std::fmt::Display) -> PipelineError {
        PipelineError::StorageUnavailable(format!("{}: {}", context, err))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, bucket: Bucket, path: &str, data: Bytes, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(self.bucket_name(bucket))
            .key(path)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| Self::unavailable("put_object", e))?;
        Ok(())
    }

    async fn get(&self, bucket: Bucket, path: &str) -> Result<Bytes> {
        let resp = self
            .client
            .get_object()
            .bucket(self.bucket_name(bucket))
            .key(path)
            .send()
            .await
            .map_err(|e| {
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() {
                    PipelineError::NotFound(path.to_string())
                } else {
                    Self::unavailable("get_object", service_err)
                }
            })?;
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| Self::unavailable("get_object body", e))?;
        Ok(data.into_bytes())
    }

    async fn delete(&self, bucket: Bucket, path: &str) -> Result<()> {
        // S3 delete of a missing key already succeeds
        self.client
            .delete_object()
            .bucket(self.bucket_name(bucket))
            .key(path)
            .send()
            .await
            .map_err(|e| Self::unavailable("delete_object", e))?;
        Ok(())
    }

    async fn delete_prefix(&self, bucket: Bucket, prefix: &str) -> Result<()> {
        let bucket_name = self.bucket_name(bucket).to_string();
        let mut continuation: Option<String> = None;
        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&bucket_name)
                .prefix(prefix)
                .set_continuation_token(continuation.clone())
                .send()
                .await
                .map_err(|e| Self::unavailable("list_objects_v2", e))?;

            let keys: Vec<ObjectIdentifier> = resp
                .contents()
                .iter()
                .filter_map(|obj| obj.key())
                .filter_map(|key| ObjectIdentifier::builder().key(key).build().ok())
                .collect();

            if !keys.is_empty() {
                let delete = Delete::builder()
                    .set_objects(Some(keys))
                    .build()
                    .map_err(|e| Self::unavailable("delete batch", e))?;
                self.client
                    .delete_objects()
                    .bucket(&bucket_name)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(|e| Self::unavailable("delete_objects", e))?;
            }

            continuation = resp.next_continuation_token().map(String::from);
            if continuation.is_none() {
                break;
            }
        }
        Ok(())
    }

    async fn list(&self, bucket: Bucket, prefix: &str, delimiter: Option<&str>) -> Result<Listing> {
        let bucket_name = self.bucket_name(bucket).to_string();
        let mut listing = Listing::default();
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&bucket_name)
                .prefix(prefix)
                .set_continuation_token(continuation.clone());
            if let Some(delim) = delimiter {
                req = req.delimiter(delim);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| Self::unavailable("list_objects_v2", e))?;

            listing
                .files
                .extend(resp.contents().iter().filter_map(|o| o.key().map(String::from)));
            listing.prefixes.extend(
                resp.common_prefixes()
                    .iter()
                    .filter_map(|p| p.prefix().map(String::from)),
            );

            continuation = resp.next_continuation_token().map(String::from);
            if continuation.is_none() {
                break;
            }
        }
        Ok(listing)
    }

    async fn exists(&self, bucket: Bucket, path: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(self.bucket_name(bucket))
            .key(path)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(Self::unavailable("head_object", service_err))
                }
            }
        }
    }

    async fn presign(&self, bucket: Bucket, path: &str, ttl: Duration) -> Result<String> {
        let config = PresigningConfig::expires_in(ttl)
            .map_err(|e| PipelineError::Config(format!("invalid presign ttl: {}", e)))?;
        let presigned = self
            .client
            .get_object()
            .bucket(self.bucket_name(bucket))
            .key(path)
            .presigned(config)
            .await
            .map_err(|e| Self::unavailable("presign", e))?;
        Ok(presigned.uri().to_string())
    }

    async fn compose(&self, bucket: Bucket, output: &str, parts: &[String]) -> Result<()> {
        let bucket_name = self.bucket_name(bucket).to_string();

        // all parts must exist before the upload is even opened
        for part in parts {
            if !self.exists(bucket, part).await? {
                return Err(PipelineError::NotFound(part.clone()));
            }
        }

        let create = self
            .client
            .create_multipart_upload()
            .bucket(&bucket_name)
            .key(output)
            .content_type(super::content_type_for(output))
            .send()
            .await
            .map_err(|e| Self::unavailable("create_multipart_upload", e))?;
        let upload_id = create.upload_id().ok_or_else(|| {
            PipelineError::StorageUnavailable("multipart upload without an id".to_string())
        })?;

        let mut completed = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let part_number = (i + 1) as i32;
            let copy = self
                .client
                .upload_part_copy()
                .bucket(&bucket_name)
                .key(output)
                .upload_id(upload_id)
                .part_number(part_number)
                .copy_source(format!("{}/{}", bucket_name, part))
                .send()
                .await;
            match copy {
                Ok(resp) => {
                    let etag = resp
                        .copy_part_result()
                        .and_then(|r| r.e_tag())
                        .unwrap_or_default()
                        .to_string();
                    completed.push(
                        CompletedPart::builder()
                            .part_number(part_number)
                            .e_tag(etag)
                            .build(),
                    );
                }
                Err(e) => {
                    // never leave a dangling multipart upload behind
                    if let Err(abort_err) = self
                        .client
                        .abort_multipart_upload()
                        .bucket(&bucket_name)
                        .key(output)
                        .upload_id(upload_id)
                        .send()
                        .await
                    {
                        warn!(output = output, error = %abort_err, "failed to abort multipart upload");
                    }
                    return Err(Self::unavailable("upload_part_copy", e));
                }
            }
        }

        self.client
            .complete_multipart_upload()
            .bucket(&bucket_name)
            .key(output)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| Self::unavailable("complete_multipart_upload", e))?;

        debug!(output = output, parts = parts.len(), "composed object server-side");
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        for bucket in [Bucket::Raw, Bucket::Processed] {
            self.client
                .head_bucket()
                .bucket(self.bucket_name(bucket))
                .send()
                .await
                .map_err(|e| Self::unavailable("head_bucket", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // Exercising this backend needs a live S3-compatible endpoint (minio in
    // docker-compose); the shared contract is covered by the local backend
    // tests and tests/upload_pipeline.rs.
}
