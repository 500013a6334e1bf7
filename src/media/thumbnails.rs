//! Thumbnail extraction
//!
//! Still frames at computed offsets, an animated preview, and an enhanced
//! poster frame. The poster's enhancement pass is cosmetic; when it fails
//! the raw extracted frame is used as-is.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, warn};

use super::command::{run_tool, stderr_of};
use super::probe::probe_duration;
use crate::types::{PipelineError, Result};

/// Filter chain for the poster pass: luma histogram equalization, a mild
/// contrast boost, and light sharpening.
const POSTER_FILTERS: &str =
    "histeq=strength=0.08:intensity=0.15,eq=contrast=1.06:brightness=0.01,unsharp=5:5:0.6:3:3:0.3";

#[async_trait]
pub trait ThumbnailMaker: Send + Sync {
    /// Extract `count` stills into `dir`, returning their paths in order.
    async fn stills(&self, source: &Path, dir: &Path, count: u32) -> Result<Vec<PathBuf>>;

    /// Produce an animated preview of `duration_s` seconds.
    async fn animated(&self, source: &Path, output: &Path, duration_s: u32) -> Result<()>;

    /// Produce an enhanced poster frame.
    async fn poster(&self, source: &Path, output: &Path) -> Result<()>;
}

pub struct FfmpegThumbnailer {
    ffmpeg: String,
    ffprobe: String,
    timeout: Duration,
}

impl FfmpegThumbnailer {
    pub fn new(ffmpeg: &str, ffprobe: &str, timeout: Duration) -> Self {
        Self {
            ffmpeg: ffmpeg.to_string(),
            ffprobe: ffprobe.to_string(),
            timeout,
        }
    }

    async fn extract_frame(&self, source: &Path, output: &Path, position: f64) -> Result<()> {
        let args = vec![
            "-ss".to_string(),
            format!("{:.3}", position),
            "-i".to_string(),
            source.to_string_lossy().to_string(),
            "-vframes".to_string(),
            "1".to_string(),
            "-q:v".to_string(),
            "2".to_string(),
            "-y".to_string(),
            output.to_string_lossy().to_string(),
        ];
        let result = run_tool(&self.ffmpeg, &args, self.timeout).await?;
        if !result.status.success() {
            return Err(PipelineError::ThumbnailFailed(format!(
                "frame extraction at {:.3}s failed: {}",
                position,
                stderr_of(&result)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ThumbnailMaker for FfmpegThumbnailer {
    async fn stills(&self, source: &Path, dir: &Path, count: u32) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(dir).await?;
        let duration = probe_duration(&self.ffprobe, source, self.timeout).await?;
        let positions = still_positions(duration, count);

        let mut paths = Vec::with_capacity(positions.len());
        for (i, position) in positions.iter().enumerate() {
            let output = dir.join(format!("thumbnail_{}.jpg", i));
            self.extract_frame(source, &output, *position).await?;
            paths.push(output);
        }
        debug!(source = %source.display(), count = paths.len(), "extracted stills");
        Ok(paths)
    }

    async fn animated(&self, source: &Path, output: &Path, duration_s: u32) -> Result<()> {
        let total = probe_duration(&self.ffprobe, source, self.timeout).await?;
        let start = animated_start(total, duration_s);
        let args = vec![
            "-ss".to_string(),
            format!("{:.3}", start),
            "-t".to_string(),
            duration_s.to_string(),
            "-i".to_string(),
            source.to_string_lossy().to_string(),
            "-vf".to_string(),
            "fps=10,scale=320:-1:flags=lanczos".to_string(),
            "-y".to_string(),
            output.to_string_lossy().to_string(),
        ];
        let result = run_tool(&self.ffmpeg, &args, self.timeout).await?;
        if !result.status.success() {
            return Err(PipelineError::ThumbnailFailed(format!(
                "animated preview failed: {}",
                stderr_of(&result)
            )));
        }
        Ok(())
    }

    async fn poster(&self, source: &Path, output: &Path) -> Result<()> {
        let duration = probe_duration(&self.ffprobe, source, self.timeout).await?;
        let raw = output.with_extension("raw.jpg");
        self.extract_frame(source, &raw, duration * 0.30).await?;

        let args = vec![
            "-i".to_string(),
            raw.to_string_lossy().to_string(),
            "-vf".to_string(),
            POSTER_FILTERS.to_string(),
            "-q:v".to_string(),
            "2".to_string(),
            "-y".to_string(),
            output.to_string_lossy().to_string(),
        ];
        match run_tool(&self.ffmpeg, &args, self.timeout).await {
            Ok(result) if result.status.success() => {
                fs::remove_file(&raw).await.ok();
            }
            Ok(result) => {
                warn!(error = %stderr_of(&result), "poster enhancement failed, keeping raw frame");
                fs::rename(&raw, output).await?;
            }
            Err(e) => {
                warn!(error = %e, "poster enhancement failed, keeping raw frame");
                fs::rename(&raw, output).await?;
            }
        }
        Ok(())
    }
}

/// Offsets for still extraction: a single shot lands at 25% of the
/// duration, multiple shots spread evenly across [10%, 90%].
pub(crate) fn still_positions(duration: f64, count: u32) -> Vec<f64> {
    if count <= 1 {
        return vec![duration * 0.25];
    }
    (0..count)
        .map(|i| duration * (0.1 + 0.8 * i as f64 / (count - 1) as f64))
        .collect()
}

/// Animated preview start: 25% in, clamped so start + length fits.
pub(crate) fn animated_start(duration: f64, clip_seconds: u32) -> f64 {
    let start = duration * 0.25;
    if start + clip_seconds as f64 > duration {
        (duration - clip_seconds as f64).max(0.0)
    } else {
        start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_still_at_quarter() {
        let positions = still_positions(100.0, 1);
        assert_eq!(positions, vec![25.0]);
    }

    #[test]
    fn test_stills_span_ten_to_ninety_percent() {
        let positions = still_positions(100.0, 3);
        assert_eq!(positions.len(), 3);
        assert!((positions[0] - 10.0).abs() < 1e-9);
        assert!((positions[1] - 50.0).abs() < 1e-9);
        assert!((positions[2] - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_animated_start_clamped() {
        assert!((animated_start(100.0, 3) - 25.0).abs() < 1e-9);
        // 25% of 4s = 1s, but 1 + 3 = 4 fits exactly
        assert!((animated_start(4.0, 3) - 1.0).abs() < 1e-9);
        // too short: clamp to 0
        assert_eq!(animated_start(2.0, 3), 0.0);
    }
}
