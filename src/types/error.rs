//! Error types for the pipeline
//!
//! One taxonomy shared across storage, upload, and processing. Backend
//! errors are translated into these variants at the storage boundary so
//! callers never see an SDK error type.

use thiserror::Error;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Video not found: {0}")]
    VideoNotFound(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Invalid chunk index: {0}")]
    InvalidChunkIndex(String),

    #[error("Invalid chunk count: {0}")]
    InvalidChunkCount(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Probe failed: {0}")]
    ProbeFailed(String),

    #[error("Transcode failed: {0}")]
    TranscodeFailed(String),

    #[error("Thumbnail generation failed: {0}")]
    ThumbnailFailed(String),

    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether a caller-level single retry is permitted for this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable(_) | Self::UpstreamTimeout(_) | Self::ConcurrencyConflict(_)
        )
    }

    /// Short operator-facing cause, truncated for metadata records
    pub fn truncated_cause(&self, max_len: usize) -> String {
        let msg = self.to_string();
        if msg.len() <= max_len {
            return msg;
        }
        // toolchain stderr may contain multi-byte text; cut on a boundary
        let mut end = max_len;
        while !msg.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &msg[..end])
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
