//! Manifest generation
//!
//! Pure functions from segment timelines to playlist/MPD text. No I/O and
//! no hidden state: identical inputs yield byte-identical output (the
//! dynamic MPD's publish time is a caller input for exactly this reason).

pub mod dash;
pub mod hls;

pub use dash::AdaptationSet;
pub use hls::VariantStream;
