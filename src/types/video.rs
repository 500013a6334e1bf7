//! Core data model: video records, quality ladder, segment descriptors
//!
//! The `VideoRecord` is the single source of truth for one video. It is
//! persisted as a JSON document at `metadata/{id}.json` and every mutation
//! goes through the per-id lock in [`crate::locks`].

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{PipelineError, Result};

/// Lifecycle states of a video record
///
/// Transitions form a DAG with a single back-edge, `error -> pending`,
/// taken only on explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Pending,
    Uploading,
    Uploaded,
    Processing,
    Ready,
    Error,
}

impl VideoStatus {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: VideoStatus) -> bool {
        use VideoStatus::*;
        matches!(
            (self, next),
            (Pending, Uploading)
                | (Pending, Uploaded)
                | (Uploading, Uploaded)
                | (Uploaded, Processing)
                | (Processing, Ready)
                | (Processing, Error)
                | (Error, Pending)
        )
    }

    /// Terminal states (absent retry)
    pub fn is_terminal(self) -> bool {
        matches!(self, VideoStatus::Ready | VideoStatus::Error)
    }
}

impl std::fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VideoStatus::Pending => "pending",
            VideoStatus::Uploading => "uploading",
            VideoStatus::Uploaded => "uploaded",
            VideoStatus::Processing => "processing",
            VideoStatus::Ready => "ready",
            VideoStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Metadata document for one video
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub company_id: String,
    pub filename: String,
    pub content_type: String,
    pub declared_size: u64,
    pub title: String,
    pub description: String,
    pub status: VideoStatus,
    pub chunks_received: u32,
    pub total_chunks: u32,
    /// Distinct chunk indices seen so far. Re-uploading an index overwrites
    /// the blob without advancing `chunks_received`.
    #[serde(default)]
    pub received_indices: BTreeSet<u32>,
    pub upload_progress: f64,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub source_checksum: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub container_format: Option<String>,
    #[serde(default)]
    pub video_codec: Option<String>,
    #[serde(default)]
    pub audio_codec: Option<String>,
    #[serde(default)]
    pub bitrate_bps: Option<u64>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub hls_master_url: Option<String>,
    #[serde(default)]
    pub dash_mpd_url: Option<String>,
    #[serde(default)]
    pub playback_url: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub cleanup_eligible_at: Option<DateTime<Utc>>,
}

impl VideoRecord {
    pub fn new(
        filename: &str,
        declared_size: u64,
        content_type: &str,
        title: Option<&str>,
        description: Option<&str>,
        owner_id: &str,
        company_id: &str,
    ) -> Self {
        let now = Utc::now();
        let default_title = filename
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(filename);
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            company_id: company_id.to_string(),
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            declared_size,
            title: title.unwrap_or(default_title).to_string(),
            description: description.unwrap_or_default().to_string(),
            status: VideoStatus::Pending,
            chunks_received: 0,
            total_chunks: 0,
            received_indices: BTreeSet::new(),
            upload_progress: 0.0,
            output_path: None,
            source_checksum: None,
            duration_seconds: None,
            width: None,
            height: None,
            container_format: None,
            video_codec: None,
            audio_codec: None,
            bitrate_bps: None,
            thumbnail_url: None,
            hls_master_url: None,
            dash_mpd_url: None,
            playback_url: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            cleanup_eligible_at: None,
        }
    }

    /// Advance `status`, enforcing the transition DAG.
    ///
    /// Also bumps `updated_at`; callers persist the record afterwards.
    pub fn transition(&mut self, next: VideoStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::Conflict(format!(
                "illegal status transition {} -> {} for video {}",
                self.status, next, self.id
            )));
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Bump `updated_at`, keeping it monotonically non-decreasing.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Base filename of the original upload (path components stripped)
    pub fn basename(&self) -> &str {
        self.filename
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.filename)
    }

    /// File extension of the original upload, lowercased
    pub fn extension(&self) -> Option<String> {
        self.basename()
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
    }
}

/// Ticket returned from upload initialization. Advisory only; the
/// authoritative state is the `VideoRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTicket {
    pub video_id: Uuid,
    pub upload_endpoint: String,
    pub expires_at: DateTime<Utc>,
}

impl UploadTicket {
    pub fn new(video_id: Uuid, upload_endpoint: &str) -> Self {
        Self {
            video_id,
            upload_endpoint: upload_endpoint.to_string(),
            expires_at: Utc::now() + Duration::hours(24),
        }
    }
}

/// Snapshot of upload progress for status queries
#[derive(Debug, Clone, Serialize)]
pub struct UploadStatus {
    pub video_id: Uuid,
    pub status: VideoStatus,
    pub progress: f64,
    pub chunks_received: u32,
    pub total_chunks: u32,
}

/// One rung of the bitrate ladder
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityProfile {
    pub name: String,
    /// Target resolution as "WxH", e.g. "1280x720"
    pub resolution: String,
    /// Video bitrate in ffmpeg notation, e.g. "2800k"
    pub video_bitrate: String,
    /// Audio bitrate in ffmpeg notation, e.g. "128k"
    pub audio_bitrate: String,
    #[serde(default = "default_codec_string")]
    pub codec_string: String,
}

fn default_codec_string() -> String {
    "avc1.64001f".to_string()
}

impl QualityProfile {
    fn new(name: &str, resolution: &str, video_bitrate: &str, audio_bitrate: &str) -> Self {
        Self {
            name: name.to_string(),
            resolution: resolution.to_string(),
            video_bitrate: video_bitrate.to_string(),
            audio_bitrate: audio_bitrate.to_string(),
            codec_string: default_codec_string(),
        }
    }

    pub fn width(&self) -> u32 {
        self.resolution
            .split_once('x')
            .and_then(|(w, _)| w.parse().ok())
            .unwrap_or(0)
    }

    pub fn height(&self) -> u32 {
        self.resolution
            .split_once('x')
            .and_then(|(_, h)| h.parse().ok())
            .unwrap_or(0)
    }

    /// Video bitrate in bits per second, for BANDWIDTH attributes
    pub fn bandwidth_bps(&self) -> u64 {
        parse_bitrate(&self.video_bitrate)
    }
}

/// Parse an ffmpeg-style bitrate ("2800k", "5M", "300000") into bps
pub fn parse_bitrate(s: &str) -> u64 {
    let s = s.trim();
    if let Some(num) = s.strip_suffix(['k', 'K']) {
        num.parse::<u64>().unwrap_or(0) * 1_000
    } else if let Some(num) = s.strip_suffix(['m', 'M']) {
        num.parse::<u64>().unwrap_or(0) * 1_000_000
    } else {
        s.parse().unwrap_or(0)
    }
}

/// The built-in ladder, ascending by bandwidth
pub fn default_ladder() -> Vec<QualityProfile> {
    vec![
        QualityProfile::new("240p", "426x240", "300k", "64k"),
        QualityProfile::new("360p", "640x360", "800k", "96k"),
        QualityProfile::new("480p", "854x480", "1400k", "128k"),
        QualityProfile::new("720p", "1280x720", "2800k", "128k"),
        QualityProfile::new("1080p", "1920x1080", "5000k", "192k"),
    ]
}

/// One HLS media segment as produced by the transcoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HlsSegment {
    pub index: u32,
    pub filename: String,
    pub duration_seconds: f64,
}

/// One DASH media segment; durations in milliseconds, `start_ms`
/// accumulates so the timeline is contiguous from 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashSegment {
    pub number: u32,
    pub start_ms: u64,
    pub duration_ms: u64,
}

/// Output formats the transcoder produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamFormat {
    Hls,
    Dash,
}

impl std::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamFormat::Hls => f.write_str("hls"),
            StreamFormat::Dash => f.write_str("dash"),
        }
    }
}
