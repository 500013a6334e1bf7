//! Shared types: error taxonomy and the video data model

pub mod error;
pub mod video;

pub use error::{PipelineError, Result};
pub use video::{
    default_ladder, parse_bitrate, DashSegment, HlsSegment, QualityProfile, StreamFormat,
    UploadStatus, UploadTicket, VideoRecord, VideoStatus,
};
