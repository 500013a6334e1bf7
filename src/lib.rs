//! Projectionist - video ingest and adaptive streaming pipeline
//!
//! Takes user-submitted video files from chunked resumable upload through
//! a transcode ladder to published HLS and MPEG-DASH manifests.
//!
//! ## Components
//!
//! - **Storage**: one blob contract over a local filesystem or an S3
//!   bucket pair, with a video-semantic facade on top
//! - **Upload**: chunk intake, progress accounting, compose-on-finalize
//! - **Media**: ffprobe/ffmpeg wrappers for probing, thumbnails, and
//!   per-quality transcoding
//! - **Manifest**: pure HLS playlist and DASH MPD generation
//! - **Pipeline**: the per-video state machine and transcode fan-out
//! - **Playback**: manifest URL issuance and view accounting
//! - **Janitor**: stall recovery, purge, and orphan sweeps

pub mod authz;
pub mod config;
pub mod events;
pub mod janitor;
pub mod locks;
pub mod manifest;
pub mod media;
pub mod metrics;
pub mod pipeline;
pub mod playback;
pub mod storage;
pub mod types;
pub mod upload;

pub use config::Args;
pub use types::{PipelineError, Result};
