//! Media toolchain wrappers
//!
//! Probing, thumbnail extraction, and transcoding, each behind a trait so
//! the orchestrator can be exercised without an ffmpeg binary. Every
//! toolchain call is a scoped subprocess with a hard timeout.

pub mod command;
pub mod probe;
pub mod thumbnails;
pub mod transcode;

pub use probe::{FfprobeProber, MediaInfo, MediaProber};
pub use thumbnails::{FfmpegThumbnailer, ThumbnailMaker};
pub use transcode::{FfmpegTranscoder, MediaTranscoder, TranscodeJob};
