//! Configuration for the pipeline service
//!
//! CLI arguments and environment variable handling using clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::types::{default_ladder, QualityProfile};

/// Which object storage backend to run against. A static choice made at
/// process start; there is no per-request switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageBackendKind {
    /// Local filesystem, rooted under two directories
    Local,
    /// S3-compatible object store, using two buckets
    S3,
}

/// Projectionist - video ingest and adaptive streaming pipeline
#[derive(Parser, Debug, Clone)]
#[command(name = "projectionist")]
#[command(about = "Video ingest, transcode ladder, and HLS/DASH publishing pipeline")]
pub struct Args {
    /// Storage backend selection
    #[arg(long, env = "STORAGE_BACKEND", value_enum, default_value = "local")]
    pub storage_backend: StorageBackendKind,

    /// Root directory for raw objects (local backend)
    #[arg(long, env = "LOCAL_RAW_DIR", default_value = "./data/raw")]
    pub local_raw_dir: PathBuf,

    /// Root directory for processed objects (local backend)
    #[arg(long, env = "LOCAL_PROCESSED_DIR", default_value = "./data/processed")]
    pub local_processed_dir: PathBuf,

    /// Bucket for raw uploads and metadata (s3 backend)
    #[arg(long, env = "RAW_BUCKET", default_value = "raw-videos")]
    pub raw_bucket: String,

    /// Bucket for transcoded artifacts (s3 backend)
    #[arg(long, env = "PROCESSED_BUCKET", default_value = "processed-videos")]
    pub processed_bucket: String,

    /// Custom S3 endpoint URL (for R2/minio style deployments)
    #[arg(long, env = "S3_ENDPOINT_URL")]
    pub s3_endpoint_url: Option<String>,

    /// Use path-style addressing for the S3 endpoint
    #[arg(long, env = "S3_FORCE_PATH_STYLE", default_value = "false")]
    pub s3_force_path_style: bool,

    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,

    /// Base URL of the authorization/identity service
    #[arg(long, env = "AUTHZ_URL")]
    pub authz_url: Option<String>,

    /// Service token for the authorization service
    #[arg(long, env = "AUTHZ_SERVICE_TOKEN")]
    pub authz_service_token: Option<String>,

    /// Timeout for calls to external collaborators, in seconds
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value = "30")]
    pub upstream_timeout_secs: u64,

    /// Upload chunk size in bytes
    #[arg(long, env = "CHUNK_SIZE", default_value = "5242880")]
    pub chunk_size: u64,

    /// Comma-separated list of accepted upload extensions
    #[arg(
        long,
        env = "ALLOWED_VIDEO_FORMATS",
        default_value = "mp4,mov,wmv,avi,avchd,flv,f4v,swf,mkv,webm,mpeg-2"
    )]
    pub allowed_video_formats: String,

    /// HLS segment duration in seconds
    #[arg(long, env = "HLS_SEGMENT_DURATION_S", default_value = "6")]
    pub hls_segment_duration_s: u32,

    /// DASH segment duration in seconds
    #[arg(long, env = "DASH_SEGMENT_DURATION_S", default_value = "4")]
    pub dash_segment_duration_s: u32,

    /// Quality ladder override as a JSON array of profiles
    /// (defaults to the built-in 240p..1080p ladder)
    #[arg(long, env = "QUALITY_PROFILES")]
    pub quality_profiles: Option<String>,

    /// Skip ladder rungs that would upscale beyond the source resolution
    #[arg(long, env = "SKIP_UPSCALE", default_value = "true")]
    pub skip_upscale: bool,

    /// Threads per transcoder invocation (0 = ffmpeg default)
    #[arg(long, env = "TRANSCODER_THREADS_PER_JOB", default_value = "4")]
    pub transcoder_threads_per_job: u32,

    /// Path to the ffmpeg binary
    #[arg(long, env = "FFMPEG_PATH", default_value = "ffmpeg")]
    pub ffmpeg_path: String,

    /// Path to the ffprobe binary
    #[arg(long, env = "FFPROBE_PATH", default_value = "ffprobe")]
    pub ffprobe_path: String,

    /// Hard timeout for a single toolchain invocation, in seconds
    #[arg(long, env = "TOOL_TIMEOUT_SECS", default_value = "1800")]
    pub tool_timeout_secs: u64,

    /// Number of still thumbnails per video
    #[arg(long, env = "THUMBNAIL_COUNT", default_value = "3")]
    pub thumbnail_count: u32,

    /// Also produce poster frame and animated preview
    #[arg(long, env = "EXTENDED_THUMBNAILS", default_value = "true")]
    pub extended_thumbnails: bool,

    /// Maximum concurrently processing videos
    #[arg(long, env = "MAX_CONCURRENT_JOBS", default_value = "2")]
    pub max_concurrent_jobs: usize,

    /// Scratch directory for staging and transcode output
    /// (system temp dir if unset)
    #[arg(long, env = "SCRATCH_DIR")]
    pub scratch_dir: Option<PathBuf>,

    /// Hours in `processing` after which a record counts as stalled
    #[arg(long, env = "STALL_HOURS", default_value = "4")]
    pub stall_hours: u32,

    /// Days after which cleanup-eligible records are purged
    #[arg(long, env = "EXPIRATION_DAYS", default_value = "30")]
    pub expiration_days: u32,

    /// Seconds between janitor sweeps
    #[arg(long, env = "JANITOR_INTERVAL_SECS", default_value = "3600")]
    pub janitor_interval_secs: u64,

    /// TTL for presigned playback URLs, in seconds
    #[arg(long, env = "PRESIGN_TTL_SECS", default_value = "3600")]
    pub presign_ttl_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// NATS connection configuration
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,
}

impl Args {
    /// Accepted upload extensions, lowercased
    pub fn allowed_formats(&self) -> Vec<String> {
        self.allowed_video_formats
            .split(',')
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// The configured quality ladder, ascending by bandwidth
    pub fn ladder(&self) -> Result<Vec<QualityProfile>, String> {
        let mut ladder = match &self.quality_profiles {
            Some(json) => serde_json::from_str::<Vec<QualityProfile>>(json)
                .map_err(|e| format!("QUALITY_PROFILES is not a valid profile array: {}", e))?,
            None => default_ladder(),
        };
        ladder.sort_by_key(|p| p.bandwidth_bps());
        Ok(ladder)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.presign_ttl_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("CHUNK_SIZE must be greater than zero".to_string());
        }
        if self.hls_segment_duration_s == 0 || self.dash_segment_duration_s == 0 {
            return Err("segment durations must be greater than zero".to_string());
        }
        if self.allowed_formats().is_empty() {
            return Err("ALLOWED_VIDEO_FORMATS must name at least one extension".to_string());
        }
        let ladder = self.ladder()?;
        if ladder.is_empty() {
            return Err("quality ladder must contain at least one profile".to_string());
        }
        for profile in &ladder {
            if profile.width() == 0 || profile.height() == 0 {
                return Err(format!(
                    "profile {} has an invalid resolution '{}'",
                    profile.name, profile.resolution
                ));
            }
        }
        if self.storage_backend == StorageBackendKind::S3 && self.raw_bucket == self.processed_bucket
        {
            return Err("raw and processed buckets must differ".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_args() -> Args {
        Args::parse_from(["projectionist"])
    }

    #[test]
    fn test_defaults() {
        let args = default_args();
        assert_eq!(args.chunk_size, 5 * 1024 * 1024);
        assert_eq!(args.hls_segment_duration_s, 6);
        assert_eq!(args.dash_segment_duration_s, 4);
        assert_eq!(args.stall_hours, 4);
        assert_eq!(args.expiration_days, 30);
        assert!(args.skip_upscale);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_allowed_formats_parsing() {
        let mut args = default_args();
        args.allowed_video_formats = "MP4, mov ,webm,".to_string();
        assert_eq!(args.allowed_formats(), vec!["mp4", "mov", "webm"]);
    }

    #[test]
    fn test_ladder_override_sorted() {
        let mut args = default_args();
        args.quality_profiles = Some(
            r#"[
                {"name":"720p","resolution":"1280x720","video_bitrate":"2800k","audio_bitrate":"128k"},
                {"name":"240p","resolution":"426x240","video_bitrate":"300k","audio_bitrate":"64k"}
            ]"#
            .to_string(),
        );
        let ladder = args.ladder().unwrap();
        assert_eq!(ladder[0].name, "240p");
        assert_eq!(ladder[1].name, "720p");
    }

    #[test]
    fn test_validate_rejects_same_buckets() {
        let mut args = default_args();
        args.storage_backend = StorageBackendKind::S3;
        args.raw_bucket = "videos".to_string();
        args.processed_bucket = "videos".to_string();
        assert!(args.validate().is_err());
    }
}
