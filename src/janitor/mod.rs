//! Background maintenance sweeps
//!
//! Recovers stalled processing runs, purges deletion-eligible records,
//! removes orphaned video directories, and clears leftover chunk scratch.
//! Every step is best-effort per record: one bad record is logged and
//! skipped, never aborting the sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::authz::VideoAuthz;
use crate::locks::IdLocks;
use crate::storage::VideoStore;
use crate::types::{Result, VideoStatus};

/// Upper bound on records examined per sweep step
const SWEEP_PAGE: usize = 1000;

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    pub stall_hours: u32,
    pub expiration_days: u32,
    pub interval: Duration,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepSummary {
    pub stalled_recovered: usize,
    pub expired_purged: usize,
    pub orphans_removed: usize,
    pub chunk_dirs_cleaned: usize,
}

pub struct Janitor {
    store: Arc<VideoStore>,
    authz: Arc<dyn VideoAuthz>,
    locks: Arc<IdLocks>,
    config: JanitorConfig,
}

impl Janitor {
    pub fn new(
        store: Arc<VideoStore>,
        authz: Arc<dyn VideoAuthz>,
        locks: Arc<IdLocks>,
        config: JanitorConfig,
    ) -> Self {
        Self {
            store,
            authz,
            locks,
            config,
        }
    }

    /// Periodic loop; runs until the task is dropped.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.store.health().await {
                warn!(error = %e, "storage health check failed, skipping sweep");
                continue;
            }
            // reported only; the sweep does not depend on the identity service
            if let Err(e) = self.authz.health().await {
                warn!(error = %e, "authz health check failed");
            }
            let summary = self.sweep().await;
            info!(
                stalled = summary.stalled_recovered,
                purged = summary.expired_purged,
                orphans = summary.orphans_removed,
                chunk_dirs = summary.chunk_dirs_cleaned,
                "janitor sweep complete"
            );
        }
    }

    /// One full pass over all maintenance jobs.
    pub async fn sweep(&self) -> SweepSummary {
        SweepSummary {
            stalled_recovered: self.recover_stalled().await,
            expired_purged: self.purge_eligible().await,
            orphans_removed: self.sweep_orphans().await,
            chunk_dirs_cleaned: self.clean_ready_chunks().await,
        }
    }

    /// Records stuck in `processing` past the stall window are failed and
    /// their partial transcode output removed.
    async fn recover_stalled(&self) -> usize {
        let mut filters = HashMap::new();
        filters.insert("status".to_string(), "processing".to_string());
        let candidates = match self.store.list_videos(&filters, 0, SWEEP_PAGE).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "stall scan failed");
                return 0;
            }
        };

        let cutoff = Utc::now() - ChronoDuration::hours(self.config.stall_hours as i64);
        let mut recovered = 0;
        for candidate in candidates {
            if candidate.updated_at >= cutoff {
                continue;
            }
            if let Err(e) = self.fail_stalled(candidate.id).await {
                warn!(video_id = %candidate.id, error = %e, "stall recovery failed");
                continue;
            }
            recovered += 1;
        }
        recovered
    }

    async fn fail_stalled(&self, video_id: Uuid) -> Result<()> {
        {
            let _guard = self.locks.acquire(video_id).await;
            let mut record = self.store.get_metadata(video_id).await?;
            // re-check under the lock; the run may have just finished
            let cutoff = Utc::now() - ChronoDuration::hours(self.config.stall_hours as i64);
            if record.status != VideoStatus::Processing || record.updated_at >= cutoff {
                return Ok(());
            }
            record.transition(VideoStatus::Error)?;
            record.error_message = Some(format!(
                "processing stalled for over {} hours",
                self.config.stall_hours
            ));
            self.store.save_metadata(&record).await?;
        }

        // partial transcode output is useless to a future retry
        self.store
            .delete_prefix(&format!("videos/{}/hls/", video_id))
            .await?;
        self.store
            .delete_prefix(&format!("videos/{}/dash/", video_id))
            .await?;
        info!(video_id = %video_id, "recovered stalled video");
        Ok(())
    }

    /// Full delete of records whose `cleanup_eligible_at` has passed and
    /// that are either past the retention window or terminally failed
    /// (which covers owner cancels deferred from mid-processing).
    async fn purge_eligible(&self) -> usize {
        let candidates = match self.store.list_videos(&HashMap::new(), 0, SWEEP_PAGE).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "purge scan failed");
                return 0;
            }
        };

        let now = Utc::now();
        let age_cutoff = now - ChronoDuration::days(self.config.expiration_days as i64);
        let mut purged = 0;
        for record in candidates {
            let eligible_at = match record.cleanup_eligible_at {
                Some(t) if t <= now => t,
                _ => continue,
            };
            if record.status == VideoStatus::Processing {
                // deferred cancel; the pipeline run has not wound down yet
                continue;
            }
            let expired = record.created_at < age_cutoff;
            let failed = record.status == VideoStatus::Error;
            if !expired && !failed {
                continue;
            }
            match self.store.delete_video_tree(record.id).await {
                Ok(()) => {
                    self.locks.forget(record.id);
                    info!(video_id = %record.id, eligible_since = %eligible_at, "purged video");
                    purged += 1;
                }
                Err(e) => warn!(video_id = %record.id, error = %e, "purge failed"),
            }
        }
        purged
    }

    /// Directories under `videos/` with no metadata document behind them.
    async fn sweep_orphans(&self) -> usize {
        let dirs = match self.store.list_video_dirs().await {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!(error = %e, "orphan scan failed");
                return 0;
            }
        };

        let mut removed = 0;
        for dir_id in dirs {
            let orphaned = match Uuid::parse_str(&dir_id) {
                Ok(id) => matches!(
                    self.store.get_metadata(id).await,
                    Err(crate::types::PipelineError::NotFound(_))
                ),
                // not even a video id; nothing can own it
                Err(_) => true,
            };
            if !orphaned {
                continue;
            }
            match self.store.delete_video_dir(&dir_id).await {
                Ok(()) => {
                    removed += 1;
                    info!(dir = %dir_id, "removed orphaned video directory");
                }
                Err(e) => warn!(dir = %dir_id, error = %e, "orphan removal failed"),
            }
        }
        removed
    }

    /// Chunk scratch of `ready` videos; covers an orchestrator that died
    /// between manifest emission and its own cleanup.
    async fn clean_ready_chunks(&self) -> usize {
        let mut filters = HashMap::new();
        filters.insert("status".to_string(), "ready".to_string());
        let ready = match self.store.list_videos(&filters, 0, SWEEP_PAGE).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "chunk cleanup scan failed");
                return 0;
            }
        };

        let mut cleaned = 0;
        for record in ready {
            match self.store.chunks_exist(record.id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(video_id = %record.id, error = %e, "chunk probe failed");
                    continue;
                }
            }
            match self
                .store
                .delete_prefix(&VideoStore::chunks_prefix(record.id))
                .await
            {
                Ok(()) => {
                    cleaned += 1;
                    info!(video_id = %record.id, "cleaned leftover chunk scratch");
                }
                Err(e) => warn!(video_id = %record.id, error = %e, "chunk cleanup failed"),
            }
        }
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::AllowAll;
    use crate::storage::LocalStore;
    use crate::types::VideoRecord;
    use bytes::Bytes;
    use tempfile::TempDir;

    async fn janitor() -> (TempDir, Janitor, Arc<VideoStore>) {
        let tmp = TempDir::new().unwrap();
        let backend = LocalStore::new(tmp.path().join("raw"), tmp.path().join("processed"))
            .await
            .unwrap();
        let store = Arc::new(VideoStore::new(Arc::new(backend), Duration::from_secs(3600)));
        let janitor = Janitor::new(
            Arc::clone(&store),
            Arc::new(AllowAll),
            Arc::new(IdLocks::new()),
            JanitorConfig {
                stall_hours: 4,
                expiration_days: 30,
                interval: Duration::from_secs(3600),
            },
        );
        (tmp, janitor, store)
    }

    fn record() -> VideoRecord {
        VideoRecord::new("a.mp4", 10, "video/mp4", None, None, "u", "c")
    }

    #[tokio::test]
    async fn test_stall_recovery() {
        let (_tmp, janitor, store) = janitor().await;

        let mut stalled = record();
        stalled.status = VideoStatus::Processing;
        stalled.updated_at = Utc::now() - ChronoDuration::hours(5);
        store.save_metadata(&stalled).await.unwrap();
        store
            .save_file(
                &VideoStore::hls_master_path(stalled.id),
                Bytes::from_static(b"#EXTM3U"),
            )
            .await
            .unwrap();
        store
            .save_file(
                &VideoStore::dash_mpd_path(stalled.id),
                Bytes::from_static(b"<MPD/>"),
            )
            .await
            .unwrap();

        // a fresh processing record must be left alone
        let mut active = record();
        active.status = VideoStatus::Processing;
        store.save_metadata(&active).await.unwrap();

        let summary = janitor.sweep().await;
        assert_eq!(summary.stalled_recovered, 1);

        let recovered = store.get_metadata(stalled.id).await.unwrap();
        assert_eq!(recovered.status, VideoStatus::Error);
        assert!(recovered.error_message.unwrap().contains("stalled"));
        assert!(!store
            .file_exists(&VideoStore::hls_master_path(stalled.id))
            .await
            .unwrap());
        assert!(!store
            .file_exists(&VideoStore::dash_mpd_path(stalled.id))
            .await
            .unwrap());

        let untouched = store.get_metadata(active.id).await.unwrap();
        assert_eq!(untouched.status, VideoStatus::Processing);
    }

    #[tokio::test]
    async fn test_expired_purge_requires_eligibility_and_age() {
        let (_tmp, janitor, store) = janitor().await;

        let mut expired = record();
        expired.status = VideoStatus::Ready;
        expired.created_at = Utc::now() - ChronoDuration::days(40);
        expired.cleanup_eligible_at = Some(Utc::now() - ChronoDuration::days(1));
        store.save_metadata(&expired).await.unwrap();

        // old but never marked eligible
        let mut old_kept = record();
        old_kept.status = VideoStatus::Ready;
        old_kept.created_at = Utc::now() - ChronoDuration::days(40);
        store.save_metadata(&old_kept).await.unwrap();

        // marked eligible but young and healthy
        let mut young = record();
        young.status = VideoStatus::Ready;
        young.cleanup_eligible_at = Some(Utc::now() - ChronoDuration::hours(1));
        store.save_metadata(&young).await.unwrap();

        let summary = janitor.sweep().await;
        assert_eq!(summary.expired_purged, 1);
        assert!(store.get_metadata(expired.id).await.is_err());
        assert!(store.get_metadata(old_kept.id).await.is_ok());
        assert!(store.get_metadata(young.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_error_record_is_purged() {
        let (_tmp, janitor, store) = janitor().await;

        let mut cancelled = record();
        cancelled.status = VideoStatus::Error;
        cancelled.error_message = Some("cancelled during processing".to_string());
        cancelled.cleanup_eligible_at = Some(Utc::now() - ChronoDuration::minutes(5));
        store.save_metadata(&cancelled).await.unwrap();
        store
            .save_chunk(cancelled.id, 0, Bytes::from_static(b"x"))
            .await
            .unwrap();

        let summary = janitor.sweep().await;
        assert_eq!(summary.expired_purged, 1);
        assert!(store.get_metadata(cancelled.id).await.is_err());
        assert!(!store.chunks_exist(cancelled.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_orphan_sweep() {
        let (_tmp, janitor, store) = janitor().await;

        // blobs with no metadata behind them
        let orphan_id = Uuid::new_v4();
        store
            .save_chunk(orphan_id, 0, Bytes::from_static(b"x"))
            .await
            .unwrap();

        // a real record's blobs stay
        let owned = record();
        store.save_metadata(&owned).await.unwrap();
        store
            .save_chunk(owned.id, 0, Bytes::from_static(b"x"))
            .await
            .unwrap();

        let summary = janitor.sweep().await;
        assert_eq!(summary.orphans_removed, 1);
        assert!(!store.chunks_exist(orphan_id).await.unwrap());
        assert!(store.chunks_exist(owned.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_ready_chunk_cleanup() {
        let (_tmp, janitor, store) = janitor().await;

        let mut ready = record();
        ready.status = VideoStatus::Ready;
        store.save_metadata(&ready).await.unwrap();
        store
            .save_chunk(ready.id, 0, Bytes::from_static(b"x"))
            .await
            .unwrap();

        let summary = janitor.sweep().await;
        assert_eq!(summary.chunk_dirs_cleaned, 1);
        assert!(!store.chunks_exist(ready.id).await.unwrap());
        // the record itself survives
        assert!(store.get_metadata(ready.id).await.is_ok());
    }
}
