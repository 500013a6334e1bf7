//! Chunked upload coordination
//!
//! Intake of resumable uploads: ticket issuance, chunk accounting, and
//! finalize/compose. Concurrent chunk uploads for one video are legal; all
//! metadata read-modify-write cycles run under the per-id lock so
//! `chunks_received` stays exact under concurrent writers.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{info, warn};
use uuid::Uuid;

use crate::authz::VideoAuthz;
use crate::events::{publish_best_effort, EventPublisher, VideoEvent};
use crate::locks::IdLocks;
use crate::metrics::{MetricKey, MetricsSink};
use crate::storage::VideoStore;
use crate::types::{PipelineError, Result, UploadStatus, UploadTicket, VideoRecord, VideoStatus};

/// Parameters for a new upload
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub filename: String,
    pub size: u64,
    pub content_type: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub owner_id: String,
    pub company_id: String,
}

pub struct UploadCoordinator {
    store: Arc<VideoStore>,
    authz: Arc<dyn VideoAuthz>,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<dyn MetricsSink>,
    locks: Arc<IdLocks>,
    allowed_formats: Vec<String>,
    upload_endpoint: String,
}

impl UploadCoordinator {
    pub fn new(
        store: Arc<VideoStore>,
        authz: Arc<dyn VideoAuthz>,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<dyn MetricsSink>,
        locks: Arc<IdLocks>,
        allowed_formats: Vec<String>,
    ) -> Self {
        Self {
            store,
            authz,
            events,
            metrics,
            locks,
            allowed_formats,
            upload_endpoint: "/api/v1/upload/chunk".to_string(),
        }
    }

    /// Create the video record and return an upload ticket.
    pub async fn initialize(&self, request: UploadRequest) -> Result<UploadTicket> {
        let extension = request
            .filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if !self.allowed_formats.iter().any(|f| f == &extension) {
            return Err(PipelineError::InvalidFormat(format!(
                "extension '{}' is not an accepted video format",
                extension
            )));
        }

        let company_user = self
            .authz
            .get_company_user(&request.owner_id, &request.company_id)
            .await?;
        if !self.authz.check_upload_permission(&company_user).await? {
            return Err(PipelineError::Forbidden(
                "user may not upload videos".to_string(),
            ));
        }
        if !self
            .authz
            .check_storage_limit(&company_user, request.size)
            .await?
        {
            return Err(PipelineError::QuotaExceeded(
                "storage quota would be exceeded".to_string(),
            ));
        }

        let record = VideoRecord::new(
            &request.filename,
            request.size,
            &request.content_type,
            request.title.as_deref(),
            request.description.as_deref(),
            &request.owner_id,
            &request.company_id,
        );
        self.store.save_metadata(&record).await?;

        self.metrics
            .incr(
                "video_uploads",
                1,
                MetricKey {
                    user_id: Some(&request.owner_id),
                    company_id: Some(&request.company_id),
                    video_id: Some(record.id),
                },
            )
            .await;

        info!(
            video_id = %record.id,
            filename = %record.filename,
            size = request.size,
            "initialized upload"
        );
        Ok(UploadTicket::new(record.id, &self.upload_endpoint))
    }

    /// Accept one chunk. Re-uploading an index overwrites the blob without
    /// double-counting; receipt of the final missing chunk finalizes the
    /// upload synchronously.
    pub async fn upload_chunk(
        &self,
        video_id: Uuid,
        chunk_index: u32,
        total_chunks: u32,
        data: Bytes,
        owner_id: &str,
    ) -> Result<UploadStatus> {
        let _guard = self.locks.acquire(video_id).await;

        let mut record = self.get_record(video_id).await?;
        if record.owner_id != owner_id {
            return Err(PipelineError::Forbidden(
                "caller does not own this video".to_string(),
            ));
        }
        if !matches!(record.status, VideoStatus::Pending | VideoStatus::Uploading) {
            return Err(PipelineError::Conflict(format!(
                "video {} is {} and no longer accepts chunks",
                video_id, record.status
            )));
        }

        // the first chunk fixes the total; later chunks must agree
        if record.total_chunks == 0 {
            if total_chunks == 0 {
                return Err(PipelineError::InvalidChunkCount(
                    "total_chunks must be at least 1".to_string(),
                ));
            }
            record.total_chunks = total_chunks;
        } else if record.total_chunks != total_chunks {
            return Err(PipelineError::InvalidChunkCount(format!(
                "expected {} chunks, got {}",
                record.total_chunks, total_chunks
            )));
        }
        if chunk_index >= record.total_chunks {
            return Err(PipelineError::InvalidChunkIndex(format!(
                "chunk index {} exceeds total chunks {}",
                chunk_index, record.total_chunks
            )));
        }

        self.store.save_chunk(video_id, chunk_index, data).await?;

        if record.received_indices.insert(chunk_index) {
            record.chunks_received = record.received_indices.len() as u32;
        }
        record.upload_progress =
            (record.chunks_received as f64 / record.total_chunks as f64) * 100.0;
        if record.status == VideoStatus::Pending {
            record.transition(VideoStatus::Uploading)?;
        } else {
            record.touch();
        }
        self.store.save_metadata(&record).await?;

        if record.chunks_received == record.total_chunks {
            self.finalize_record(&mut record).await?;
        }

        Ok(UploadStatus {
            video_id,
            status: record.status,
            progress: record.upload_progress,
            chunks_received: record.chunks_received,
            total_chunks: record.total_chunks,
        })
    }

    /// Explicit finalize, for clients that drive it themselves.
    pub async fn finalize(&self, video_id: Uuid, owner_id: &str) -> Result<UploadStatus> {
        let _guard = self.locks.acquire(video_id).await;

        let mut record = self.get_record(video_id).await?;
        if record.owner_id != owner_id {
            return Err(PipelineError::Forbidden(
                "caller does not own this video".to_string(),
            ));
        }
        self.finalize_record(&mut record).await?;
        Ok(UploadStatus {
            video_id,
            status: record.status,
            progress: record.upload_progress,
            chunks_received: record.chunks_received,
            total_chunks: record.total_chunks,
        })
    }

    /// Compose chunks and mark the record uploaded. Caller holds the lock.
    async fn finalize_record(&self, record: &mut VideoRecord) -> Result<()> {
        if record.total_chunks == 0 || record.chunks_received != record.total_chunks {
            let missing = record.total_chunks.saturating_sub(record.chunks_received);
            return Err(PipelineError::InvalidChunkCount(format!(
                "cannot finalize: {} chunks are missing",
                missing
            )));
        }

        let output = self
            .store
            .compose_chunks(record.id, record.total_chunks, &record.filename)
            .await?;
        match self.store.checksum(&output).await {
            Ok(checksum) => record.source_checksum = Some(checksum),
            Err(e) => warn!(video_id = %record.id, error = %e, "checksum of composed source failed"),
        }

        record.transition(VideoStatus::Uploaded)?;
        record.output_path = Some(output);
        self.store.save_metadata(record).await?;

        self.metrics
            .incr(
                "storage_bytes",
                record.declared_size,
                MetricKey {
                    user_id: Some(&record.owner_id),
                    company_id: Some(&record.company_id),
                    video_id: Some(record.id),
                },
            )
            .await;

        // only after the uploaded state is durable
        publish_best_effort(
            self.events.as_ref(),
            &VideoEvent::uploaded(record.id, &record.owner_id, &record.company_id),
        )
        .await;

        info!(video_id = %record.id, output = ?record.output_path, "upload finalized");
        Ok(())
    }

    pub async fn get_status(&self, video_id: Uuid, owner_id: &str) -> Result<UploadStatus> {
        let record = self.get_record(video_id).await?;
        if record.owner_id != owner_id {
            // existence is not revealed to non-owners
            return Err(PipelineError::VideoNotFound(video_id.to_string()));
        }
        Ok(UploadStatus {
            video_id,
            status: record.status,
            progress: record.upload_progress,
            chunks_received: record.chunks_received,
            total_chunks: record.total_chunks,
        })
    }

    /// Cancel an upload or delete a finished video. A video currently
    /// processing is only marked; the janitor deletes it once the running
    /// stage finishes.
    pub async fn cancel(&self, video_id: Uuid, owner_id: &str) -> Result<()> {
        let _guard = self.locks.acquire(video_id).await;

        let mut record = self.get_record(video_id).await?;
        if record.owner_id != owner_id {
            return Err(PipelineError::VideoNotFound(video_id.to_string()));
        }

        if record.status == VideoStatus::Processing {
            record.cleanup_eligible_at = Some(chrono::Utc::now());
            record.touch();
            self.store.save_metadata(&record).await?;
            info!(video_id = %video_id, "cancel requested mid-processing, deferred to janitor");
            return Ok(());
        }

        self.store.delete_video_tree(video_id).await?;
        drop(_guard);
        self.locks.forget(video_id);
        info!(video_id = %video_id, "upload cancelled and deleted");
        Ok(())
    }

    async fn get_record(&self, video_id: Uuid) -> Result<VideoRecord> {
        match self.store.get_metadata(video_id).await {
            Ok(record) => Ok(record),
            Err(PipelineError::NotFound(_)) => {
                Err(PipelineError::VideoNotFound(video_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::AllowAll;
    use crate::events::NoopPublisher;
    use crate::metrics::NoopMetrics;
    use crate::storage::LocalStore;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn coordinator() -> (TempDir, UploadCoordinator, Arc<VideoStore>) {
        let tmp = TempDir::new().unwrap();
        let backend = LocalStore::new(tmp.path().join("raw"), tmp.path().join("processed"))
            .await
            .unwrap();
        let store = Arc::new(VideoStore::new(Arc::new(backend), Duration::from_secs(3600)));
        let coordinator = UploadCoordinator::new(
            Arc::clone(&store),
            Arc::new(AllowAll),
            Arc::new(NoopPublisher),
            Arc::new(NoopMetrics),
            Arc::new(IdLocks::new()),
            vec!["mp4".to_string(), "webm".to_string()],
        );
        (tmp, coordinator, store)
    }

    fn request(filename: &str) -> UploadRequest {
        UploadRequest {
            filename: filename.to_string(),
            size: 12,
            content_type: "video/mp4".to_string(),
            title: None,
            description: None,
            owner_id: "alice".to_string(),
            company_id: "acme".to_string(),
        }
    }

    #[tokio::test]
    async fn test_initialize_rejects_bad_extension() {
        let (_tmp, coordinator, _store) = coordinator().await;
        let err = coordinator.initialize(request("doc.pdf")).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidFormat(_)));
    }

    #[tokio::test]
    async fn test_chunk_bounds_and_count_validation() {
        let (_tmp, coordinator, _store) = coordinator().await;
        let ticket = coordinator.initialize(request("a.mp4")).await.unwrap();

        let err = coordinator
            .upload_chunk(ticket.video_id, 3, 3, Bytes::from_static(b"x"), "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidChunkIndex(_)));

        coordinator
            .upload_chunk(ticket.video_id, 0, 3, Bytes::from_static(b"x"), "alice")
            .await
            .unwrap();
        let err = coordinator
            .upload_chunk(ticket.video_id, 1, 4, Bytes::from_static(b"x"), "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidChunkCount(_)));
    }

    #[tokio::test]
    async fn test_owner_check_is_mandatory() {
        let (_tmp, coordinator, _store) = coordinator().await;
        let ticket = coordinator.initialize(request("a.mp4")).await.unwrap();
        let err = coordinator
            .upload_chunk(ticket.video_id, 0, 1, Bytes::from_static(b"x"), "mallory")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_duplicate_chunk_not_double_counted() {
        let (_tmp, coordinator, store) = coordinator().await;
        let ticket = coordinator.initialize(request("a.mp4")).await.unwrap();

        let status = coordinator
            .upload_chunk(ticket.video_id, 1, 2, Bytes::from_static(b"bb"), "alice")
            .await
            .unwrap();
        assert_eq!(status.chunks_received, 1);

        // same index again: overwritten, not recounted
        let status = coordinator
            .upload_chunk(ticket.video_id, 1, 2, Bytes::from_static(b"BB"), "alice")
            .await
            .unwrap();
        assert_eq!(status.chunks_received, 1);
        assert_eq!(status.status, VideoStatus::Uploading);

        let status = coordinator
            .upload_chunk(ticket.video_id, 0, 2, Bytes::from_static(b"aa"), "alice")
            .await
            .unwrap();
        assert_eq!(status.status, VideoStatus::Uploaded);

        let record = store.get_metadata(ticket.video_id).await.unwrap();
        let data = store
            .get_file(record.output_path.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(&data[..], b"aaBB");
    }

    #[tokio::test]
    async fn test_finalize_refuses_incomplete() {
        let (_tmp, coordinator, _store) = coordinator().await;
        let ticket = coordinator.initialize(request("a.mp4")).await.unwrap();
        coordinator
            .upload_chunk(ticket.video_id, 0, 4, Bytes::from_static(b"x"), "alice")
            .await
            .unwrap();
        let err = coordinator
            .finalize(ticket.video_id, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidChunkCount(_)));
    }

    #[tokio::test]
    async fn test_cancel_removes_everything() {
        let (_tmp, coordinator, store) = coordinator().await;
        let ticket = coordinator.initialize(request("a.mp4")).await.unwrap();
        coordinator
            .upload_chunk(ticket.video_id, 0, 4, Bytes::from_static(b"x"), "alice")
            .await
            .unwrap();

        coordinator.cancel(ticket.video_id, "alice").await.unwrap();
        assert!(matches!(
            store.get_metadata(ticket.video_id).await.unwrap_err(),
            PipelineError::NotFound(_)
        ));
        assert!(!store
            .file_exists(&VideoStore::chunk_path(ticket.video_id, 0))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_status_hides_existence_from_non_owner() {
        let (_tmp, coordinator, _store) = coordinator().await;
        let ticket = coordinator.initialize(request("a.mp4")).await.unwrap();
        let err = coordinator
            .get_status(ticket.video_id, "mallory")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::VideoNotFound(_)));
    }
}
