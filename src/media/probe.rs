//! Media probing via ffprobe
//!
//! Extracts duration, geometry, codecs, and bitrate from the container and
//! first video/audio streams, plus best-effort quality flags. Only the main
//! probe is fatal; issue detection degrades to empty flags.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::command::{run_tool, stderr_of};
use crate::types::{PipelineError, Result};

/// Probed facts about a source file
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
    pub bitrate_bps: u64,
    pub size_bytes: u64,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub container_format: String,
    pub issues: MediaIssues,
}

#[derive(Debug, Clone, Default)]
pub struct MediaIssues {
    pub audio: AudioIssues,
    pub video: VideoIssues,
}

#[derive(Debug, Clone, Default)]
pub struct AudioIssues {
    pub silent: bool,
    pub low_volume: bool,
    pub max_volume: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct VideoIssues {
    pub low_resolution: bool,
    pub odd_resolution: bool,
    pub low_bitrate: bool,
    pub low_frame_rate: bool,
}

#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe(&self, source: &Path) -> Result<MediaInfo>;
}

pub struct FfprobeProber {
    ffprobe: String,
    ffmpeg: String,
    timeout: Duration,
    allowed_formats: Vec<String>,
}

impl FfprobeProber {
    pub fn new(
        ffprobe: &str,
        ffmpeg: &str,
        timeout: Duration,
        allowed_formats: Vec<String>,
    ) -> Self {
        Self {
            ffprobe: ffprobe.to_string(),
            ffmpeg: ffmpeg.to_string(),
            timeout,
            allowed_formats,
        }
    }

    /// Best-effort audio level check via the volumedetect filter.
    async fn audio_issues(&self, source: &Path) -> AudioIssues {
        let args = vec![
            "-i".to_string(),
            source.to_string_lossy().to_string(),
            "-af".to_string(),
            "volumedetect".to_string(),
            "-vn".to_string(),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ];
        match run_tool(&self.ffmpeg, &args, self.timeout).await {
            Ok(output) => {
                let stderr = stderr_of(&output);
                audio_issues_from(parse_max_volume(&stderr))
            }
            Err(e) => {
                warn!(source = %source.display(), error = %e, "audio issue probe failed");
                AudioIssues::default()
            }
        }
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, source: &Path) -> Result<MediaInfo> {
        let args = vec![
            "-v".to_string(),
            "quiet".to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_format".to_string(),
            "-show_streams".to_string(),
            source.to_string_lossy().to_string(),
        ];
        let output = run_tool(&self.ffprobe, &args, self.timeout).await?;
        if !output.status.success() {
            return Err(PipelineError::ProbeFailed(stderr_of(&output)));
        }

        let filename = source
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut info = parse_probe_output(&output.stdout, &filename, &self.allowed_formats)?;

        // quality flags are advisory and must never fail the probe
        let video_issues = video_issues_from(&info, frame_rate_of(&output.stdout));
        info.issues.video = video_issues;
        info.issues.audio = self.audio_issues(source).await;

        debug!(
            source = %source.display(),
            duration = info.duration_seconds,
            width = info.width,
            height = info.height,
            container = %info.container_format,
            "probed source"
        );
        Ok(info)
    }
}

// ----------------------------------------------------------------------
// ffprobe JSON payload
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ProbeDoc {
    format: ProbeFormat,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    #[serde(default)]
    format_name: String,
    duration: Option<String>,
    size: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    bit_rate: Option<String>,
    avg_frame_rate: Option<String>,
}

/// Decode the ffprobe JSON document into [`MediaInfo`] (issues left empty).
pub(crate) fn parse_probe_output(
    json: &[u8],
    filename: &str,
    allowed_formats: &[String],
) -> Result<MediaInfo> {
    let doc: ProbeDoc = serde_json::from_slice(json)
        .map_err(|e| PipelineError::ProbeFailed(format!("unreadable ffprobe output: {}", e)))?;

    let video = doc
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let audio = doc
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let duration_seconds = doc
        .format
        .duration
        .as_deref()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);
    let size_bytes = doc
        .format
        .size
        .as_deref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);
    let mut bitrate_bps = doc
        .format
        .bit_rate
        .as_deref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);
    if bitrate_bps == 0 && duration_seconds > 0.0 {
        bitrate_bps = ((size_bytes as f64) * 8.0 / duration_seconds) as u64;
    }

    Ok(MediaInfo {
        duration_seconds,
        width: video.and_then(|s| s.width).unwrap_or(0),
        height: video.and_then(|s| s.height).unwrap_or(0),
        bitrate_bps,
        size_bytes,
        video_codec: video.and_then(|s| s.codec_name.clone()),
        audio_codec: audio.and_then(|s| s.codec_name.clone()),
        container_format: detect_container(&doc.format.format_name, filename, allowed_formats),
        issues: MediaIssues::default(),
    })
}

fn frame_rate_of(json: &[u8]) -> Option<f64> {
    let doc: ProbeDoc = serde_json::from_slice(json).ok()?;
    let video = doc
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))?;
    parse_frame_rate(video.avg_frame_rate.as_deref()?)
}

/// "30000/1001" -> 29.97...
pub(crate) fn parse_frame_rate(rate: &str) -> Option<f64> {
    let (num, den) = rate.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    if den > 0.0 {
        Some(num / den)
    } else {
        None
    }
}

/// Container from the reported format name, falling back to the file
/// extension when it is in the allowed set, else the generic "video".
pub(crate) fn detect_container(format_name: &str, filename: &str, allowed: &[String]) -> String {
    for (needle, container) in [
        ("mp4", "mp4"),
        ("webm", "webm"),
        ("matroska", "mkv"),
        ("avi", "avi"),
        ("quicktime", "mov"),
        ("mov", "mov"),
        ("flv", "flv"),
        ("mpegts", "ts"),
        ("mpeg", "mpeg"),
    ] {
        if format_name.contains(needle) {
            return container.to_string();
        }
    }
    if let Some((_, ext)) = filename.rsplit_once('.') {
        let ext = ext.to_ascii_lowercase();
        if allowed.iter().any(|a| a == &ext) {
            return ext;
        }
    }
    "video".to_string()
}

/// Pull "max_volume: -12.3 dB" out of volumedetect stderr
pub(crate) fn parse_max_volume(stderr: &str) -> Option<f64> {
    for line in stderr.lines() {
        if let Some(rest) = line.split("max_volume:").nth(1) {
            let value = rest.trim().trim_end_matches("dB").trim();
            if let Ok(db) = value.parse::<f64>() {
                return Some(db);
            }
        }
    }
    None
}

pub(crate) fn audio_issues_from(max_volume: Option<f64>) -> AudioIssues {
    match max_volume {
        Some(db) if db <= -90.0 => AudioIssues {
            silent: true,
            low_volume: false,
            max_volume: Some(db),
        },
        Some(db) if db < -20.0 => AudioIssues {
            silent: false,
            low_volume: true,
            max_volume: Some(db),
        },
        Some(db) => AudioIssues {
            silent: false,
            low_volume: false,
            max_volume: Some(db),
        },
        None => AudioIssues::default(),
    }
}

pub(crate) fn video_issues_from(info: &MediaInfo, fps: Option<f64>) -> VideoIssues {
    VideoIssues {
        low_resolution: info.width < 480 || info.height < 360,
        odd_resolution: info.width % 2 != 0 || info.height % 2 != 0,
        low_bitrate: info.bitrate_bps > 0 && info.bitrate_bps < 500_000,
        low_frame_rate: fps.map(|f| f < 24.0).unwrap_or(false),
    }
}

/// Duration of a media file in seconds (used for segment re-probing and
/// thumbnail positioning).
pub async fn probe_duration(ffprobe: &str, path: &Path, timeout: Duration) -> Result<f64> {
    let args = vec![
        "-v".to_string(),
        "error".to_string(),
        "-show_entries".to_string(),
        "format=duration".to_string(),
        "-of".to_string(),
        "default=noprint_wrappers=1:nokey=1".to_string(),
        path.to_string_lossy().to_string(),
    ];
    let output = run_tool(ffprobe, &args, timeout).await?;
    if !output.status.success() {
        return Err(PipelineError::ProbeFailed(stderr_of(&output)));
    }
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<f64>()
        .map_err(|e| PipelineError::ProbeFailed(format!("unparsable duration: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"codec_type": "video", "codec_name": "h264", "width": 1280, "height": 720,
             "avg_frame_rate": "30000/1001", "bit_rate": "2500000"},
            {"codec_type": "audio", "codec_name": "aac", "bit_rate": "128000"}
        ],
        "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "30.500000",
                   "size": "12000000", "bit_rate": "3147540"}
    }"#;

    fn allowed() -> Vec<String> {
        vec!["mp4".into(), "mkv".into(), "webm".into()]
    }

    #[test]
    fn test_parse_probe_output() {
        let info = parse_probe_output(SAMPLE.as_bytes(), "clip.mp4", &allowed()).unwrap();
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 720);
        assert!((info.duration_seconds - 30.5).abs() < 1e-9);
        assert_eq!(info.bitrate_bps, 3_147_540);
        assert_eq!(info.video_codec.as_deref(), Some("h264"));
        assert_eq!(info.audio_codec.as_deref(), Some("aac"));
        assert_eq!(info.container_format, "mp4");
    }

    #[test]
    fn test_bitrate_fallback_from_size() {
        let json = r#"{
            "streams": [{"codec_type": "video", "width": 640, "height": 360}],
            "format": {"format_name": "webm", "duration": "10.0", "size": "1000000"}
        }"#;
        let info = parse_probe_output(json.as_bytes(), "a.webm", &allowed()).unwrap();
        assert_eq!(info.bitrate_bps, 800_000);
        assert_eq!(info.container_format, "webm");
    }

    #[test]
    fn test_detect_container_fallbacks() {
        assert_eq!(detect_container("matroska,webm", "a.bin", &allowed()), "mkv");
        assert_eq!(detect_container("quicktime", "a.bin", &allowed()), "mov");
        assert_eq!(detect_container("mpegts", "a.bin", &allowed()), "ts");
        // unknown format name, known extension
        assert_eq!(detect_container("oddball", "clip.MKV", &allowed()), "mkv");
        // nothing matches
        assert_eq!(detect_container("oddball", "clip.xyz", &allowed()), "video");
    }

    #[test]
    fn test_parse_max_volume() {
        let stderr = "[Parsed_volumedetect_0 @ 0x55] mean_volume: -23.1 dB\n\
                      [Parsed_volumedetect_0 @ 0x55] max_volume: -5.2 dB";
        assert_eq!(parse_max_volume(stderr), Some(-5.2));
        assert_eq!(parse_max_volume("no volume here"), None);
    }

    #[test]
    fn test_audio_issue_thresholds() {
        assert!(audio_issues_from(Some(-91.0)).silent);
        let low = audio_issues_from(Some(-25.0));
        assert!(low.low_volume && !low.silent);
        let fine = audio_issues_from(Some(-3.0));
        assert!(!fine.low_volume && !fine.silent);
    }

    #[test]
    fn test_video_issue_thresholds() {
        let mut info = MediaInfo {
            width: 426,
            height: 240,
            bitrate_bps: 300_000,
            ..Default::default()
        };
        let issues = video_issues_from(&info, Some(15.0));
        assert!(issues.low_resolution);
        assert!(issues.low_bitrate);
        assert!(issues.low_frame_rate);
        assert!(!issues.odd_resolution);

        info.width = 1281;
        info.height = 720;
        info.bitrate_bps = 3_000_000;
        let issues = video_issues_from(&info, Some(30.0));
        assert!(issues.odd_resolution);
        assert!(!issues.low_resolution);
        assert!(!issues.low_bitrate);
        assert!(!issues.low_frame_rate);
    }

    #[test]
    fn test_parse_frame_rate() {
        assert!((parse_frame_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("junk"), None);
    }
}
