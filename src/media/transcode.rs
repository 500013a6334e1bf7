//! Transcoding one (quality, format) pair
//!
//! Each invocation writes into its own output directory, so the
//! orchestrator can fan invocations out across tasks with no shared state
//! here. Encoder settings pin segment boundaries to IDR frames: fixed GOP
//! of twice the segment duration, minimum keyframe interval of one segment,
//! and scene-change detection disabled.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::command::{run_tool, stderr_of};
use super::probe::probe_duration;
use crate::types::{DashSegment, HlsSegment, PipelineError, QualityProfile, Result};

/// Inputs for one transcoder invocation
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub source: PathBuf,
    pub output_dir: PathBuf,
    pub profile: QualityProfile,
    pub segment_duration: u32,
}

#[async_trait]
pub trait MediaTranscoder: Send + Sync {
    async fn transcode_hls(&self, job: &TranscodeJob) -> Result<Vec<HlsSegment>>;
    async fn transcode_dash(&self, job: &TranscodeJob) -> Result<Vec<DashSegment>>;
}

pub struct FfmpegTranscoder {
    ffmpeg: String,
    ffprobe: String,
    threads: u32,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg: &str, ffprobe: &str, threads: u32, timeout: Duration) -> Self {
        Self {
            ffmpeg: ffmpeg.to_string(),
            ffprobe: ffprobe.to_string(),
            threads,
            timeout,
        }
    }

    async fn run(&self, args: Vec<String>, job: &TranscodeJob) -> Result<()> {
        tokio::fs::create_dir_all(&job.output_dir).await?;
        let output = run_tool(&self.ffmpeg, &args, self.timeout).await?;
        if !output.status.success() {
            // the partial output directory stays behind for diagnostics
            return Err(PipelineError::TranscodeFailed(format!(
                "{} {}: {}",
                job.profile.name,
                job.source.display(),
                stderr_of(&output)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaTranscoder for FfmpegTranscoder {
    async fn transcode_hls(&self, job: &TranscodeJob) -> Result<Vec<HlsSegment>> {
        let args = hls_args(job, self.threads);
        self.run(args, job).await?;
        let segments = scan_hls_segments(
            &self.ffprobe,
            &job.output_dir,
            job.segment_duration,
            self.timeout,
        )
        .await?;
        debug!(
            quality = %job.profile.name,
            segments = segments.len(),
            "hls transcode complete"
        );
        Ok(segments)
    }

    async fn transcode_dash(&self, job: &TranscodeJob) -> Result<Vec<DashSegment>> {
        let args = dash_args(job, self.threads);
        self.run(args, job).await?;
        let segments = scan_dash_segments(
            &self.ffprobe,
            &job.output_dir,
            job.segment_duration,
            self.timeout,
        )
        .await?;
        debug!(
            quality = %job.profile.name,
            segments = segments.len(),
            "dash transcode complete"
        );
        Ok(segments)
    }
}

/// Shared encoder settings for both formats
fn encoder_args(job: &TranscodeJob, threads: u32) -> Vec<String> {
    let mut args = vec![
        "-i".to_string(),
        job.source.to_string_lossy().to_string(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:v".to_string(),
        job.profile.video_bitrate.clone(),
        "-b:a".to_string(),
        job.profile.audio_bitrate.clone(),
        "-s".to_string(),
        job.profile.resolution.clone(),
        "-profile:v".to_string(),
        "main".to_string(),
        "-level".to_string(),
        "3.1".to_string(),
        "-g".to_string(),
        (job.segment_duration * 2).to_string(),
        "-keyint_min".to_string(),
        job.segment_duration.to_string(),
        "-sc_threshold".to_string(),
        "0".to_string(),
    ];
    if threads > 0 {
        args.push("-threads".to_string());
        args.push(threads.to_string());
    }
    args
}

pub(crate) fn hls_args(job: &TranscodeJob, threads: u32) -> Vec<String> {
    let mut args = encoder_args(job, threads);
    args.extend([
        "-hls_time".to_string(),
        job.segment_duration.to_string(),
        "-hls_list_size".to_string(),
        "0".to_string(),
        "-hls_segment_filename".to_string(),
        job.output_dir
            .join("segment_%03d.ts")
            .to_string_lossy()
            .to_string(),
        "-f".to_string(),
        "hls".to_string(),
        "-y".to_string(),
        // throwaway playlist; the real variant playlist is regenerated
        // from the probed segment timeline
        job.output_dir
            .join("playlist.m3u8")
            .to_string_lossy()
            .to_string(),
    ]);
    args
}

pub(crate) fn dash_args(job: &TranscodeJob, threads: u32) -> Vec<String> {
    let mut args = encoder_args(job, threads);
    args.extend([
        "-use_timeline".to_string(),
        "1".to_string(),
        "-use_template".to_string(),
        "1".to_string(),
        "-init_seg_name".to_string(),
        "init.mp4".to_string(),
        "-media_seg_name".to_string(),
        "segment-$Number$.m4s".to_string(),
        "-seg_duration".to_string(),
        job.segment_duration.to_string(),
        "-adaptation_sets".to_string(),
        "id=0,streams=v id=1,streams=a".to_string(),
        "-f".to_string(),
        "dash".to_string(),
        "-y".to_string(),
        job.output_dir
            .join("manifest.mpd")
            .to_string_lossy()
            .to_string(),
    ]);
    args
}

/// Walk `segment_000.ts, segment_001.ts, ...` and re-probe each segment's
/// real duration, falling back to the nominal duration when probing fails.
pub(crate) async fn scan_hls_segments(
    ffprobe: &str,
    dir: &Path,
    nominal_duration: u32,
    timeout: Duration,
) -> Result<Vec<HlsSegment>> {
    let mut segments = Vec::new();
    let mut index = 0u32;
    loop {
        let filename = format!("segment_{:03}.ts", index);
        let path = dir.join(&filename);
        if tokio::fs::metadata(&path).await.is_err() {
            break;
        }
        let duration = match probe_duration(ffprobe, &path, timeout).await {
            Ok(d) => d,
            Err(e) => {
                warn!(segment = %filename, error = %e, "segment probe failed, using nominal duration");
                nominal_duration as f64
            }
        };
        segments.push(HlsSegment {
            index,
            filename,
            duration_seconds: duration,
        });
        index += 1;
    }
    Ok(segments)
}

/// Walk `segment-1.m4s, segment-2.m4s, ...`; durations in milliseconds and
/// `start_ms` accumulating so the timeline is contiguous from 0.
pub(crate) async fn scan_dash_segments(
    ffprobe: &str,
    dir: &Path,
    nominal_duration: u32,
    timeout: Duration,
) -> Result<Vec<DashSegment>> {
    let mut segments = Vec::new();
    let mut number = 1u32;
    let mut start_ms = 0u64;
    loop {
        let path = dir.join(format!("segment-{}.m4s", number));
        if tokio::fs::metadata(&path).await.is_err() {
            break;
        }
        let duration_ms = match probe_duration(ffprobe, &path, timeout).await {
            Ok(d) => (d * 1000.0) as u64,
            Err(e) => {
                warn!(segment = number, error = %e, "segment probe failed, using nominal duration");
                nominal_duration as u64 * 1000
            }
        };
        segments.push(DashSegment {
            number,
            start_ms,
            duration_ms,
        });
        start_ms += duration_ms;
        number += 1;
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::default_ladder;
    use tempfile::TempDir;

    fn job(dir: &Path) -> TranscodeJob {
        TranscodeJob {
            source: PathBuf::from("/tmp/in.mp4"),
            output_dir: dir.to_path_buf(),
            profile: default_ladder().remove(3), // 720p
            segment_duration: 6,
        }
    }

    #[test]
    fn test_hls_args_encoder_contract() {
        let tmp = TempDir::new().unwrap();
        let args = hls_args(&job(tmp.path()), 4);
        let joined = args.join(" ");
        assert!(joined.contains("-profile:v main"));
        assert!(joined.contains("-level 3.1"));
        assert!(joined.contains("-g 12"));
        assert!(joined.contains("-keyint_min 6"));
        assert!(joined.contains("-sc_threshold 0"));
        assert!(joined.contains("-threads 4"));
        assert!(joined.contains("-hls_time 6"));
        assert!(joined.contains("segment_%03d.ts"));
        assert!(joined.contains("-b:v 2800k"));
        assert!(joined.contains("-s 1280x720"));
    }

    #[test]
    fn test_dash_args_encoder_contract() {
        let tmp = TempDir::new().unwrap();
        let args = dash_args(&job(tmp.path()), 0);
        let joined = args.join(" ");
        assert!(joined.contains("-init_seg_name init.mp4"));
        assert!(joined.contains("-media_seg_name segment-$Number$.m4s"));
        assert!(joined.contains("-seg_duration 6"));
        assert!(joined.contains("-use_timeline 1"));
        assert!(!joined.contains("-threads"));
    }

    #[tokio::test]
    async fn test_scan_hls_segments_ordered_with_fallback() {
        let tmp = TempDir::new().unwrap();
        for i in 0..4 {
            std::fs::write(tmp.path().join(format!("segment_{:03}.ts", i)), b"x").unwrap();
        }
        // a gap after the contiguous run must stop the scan
        std::fs::write(tmp.path().join("segment_009.ts"), b"x").unwrap();

        // probe binary is absent, so every duration falls back to nominal
        let segments = scan_hls_segments("ffprobe-absent", tmp.path(), 6, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(segments.len(), 4);
        for (i, segment) in segments.iter().enumerate() {
            assert_eq!(segment.index, i as u32);
            assert_eq!(segment.filename, format!("segment_{:03}.ts", i));
            assert!((segment.duration_seconds - 6.0).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_scan_dash_segments_contiguous_timeline() {
        let tmp = TempDir::new().unwrap();
        for n in 1..=3 {
            std::fs::write(tmp.path().join(format!("segment-{}.m4s", n)), b"x").unwrap();
        }
        let segments = scan_dash_segments("ffprobe-absent", tmp.path(), 4, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].number, 1);
        assert_eq!(segments[0].start_ms, 0);
        for pair in segments.windows(2) {
            assert_eq!(pair[1].start_ms, pair[0].start_ms + pair[0].duration_ms);
        }
    }
}
