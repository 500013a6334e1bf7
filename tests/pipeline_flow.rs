//! Full pipeline orchestration over the local backend, with the media
//! toolchain mocked out behind the prober/thumbnailer/transcoder seams.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::Mutex;

use projectionist::authz::AllowAll;
use projectionist::events::{EventPublisher, ProcessedStatus, VideoEvent};
use projectionist::locks::IdLocks;
use projectionist::media::{MediaInfo, MediaProber, MediaTranscoder, ThumbnailMaker, TranscodeJob};
use projectionist::metrics::NoopMetrics;
use projectionist::pipeline::{PipelineConfig, PipelineOrchestrator};
use projectionist::storage::{LocalStore, VideoStore};
use projectionist::types::{
    default_ladder, DashSegment, HlsSegment, PipelineError, Result, VideoRecord, VideoStatus,
};

// ----------------------------------------------------------------------
// Mock media stages
// ----------------------------------------------------------------------

struct MockProber {
    width: u32,
    height: u32,
}

#[async_trait]
impl MediaProber for MockProber {
    async fn probe(&self, _source: &Path) -> Result<MediaInfo> {
        Ok(MediaInfo {
            duration_seconds: 30.0,
            width: self.width,
            height: self.height,
            bitrate_bps: 3_000_000,
            size_bytes: 11_250_000,
            video_codec: Some("h264".to_string()),
            audio_codec: Some("aac".to_string()),
            container_format: "mp4".to_string(),
            ..Default::default()
        })
    }
}

struct MockThumbnailer;

#[async_trait]
impl ThumbnailMaker for MockThumbnailer {
    async fn stills(&self, _source: &Path, dir: &Path, count: u32) -> Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(dir).await?;
        let mut paths = Vec::new();
        for i in 0..count {
            let path = dir.join(format!("thumbnail_{}.jpg", i));
            tokio::fs::write(&path, b"jpeg").await?;
            paths.push(path);
        }
        Ok(paths)
    }

    async fn animated(&self, _source: &Path, output: &Path, _duration_s: u32) -> Result<()> {
        tokio::fs::write(output, b"gif").await?;
        Ok(())
    }

    async fn poster(&self, _source: &Path, output: &Path) -> Result<()> {
        tokio::fs::write(output, b"poster").await?;
        Ok(())
    }
}

/// Writes plausible segment files and returns their descriptors; segment
/// count and durations derive from the job's segment duration over a 30 s
/// source.
struct MockTranscoder {
    fail_quality: Option<String>,
}

#[async_trait]
impl MediaTranscoder for MockTranscoder {
    async fn transcode_hls(&self, job: &TranscodeJob) -> Result<Vec<HlsSegment>> {
        if self.fail_quality.as_deref() == Some(job.profile.name.as_str()) {
            return Err(PipelineError::TranscodeFailed(format!(
                "{}: synthetic encoder failure",
                job.profile.name
            )));
        }
        tokio::fs::create_dir_all(&job.output_dir).await?;
        let nominal = job.segment_duration as f64;
        let mut segments = Vec::new();
        let mut remaining = 30.0f64;
        let mut index = 0u32;
        while remaining > 0.0 {
            let duration = remaining.min(nominal);
            let filename = format!("segment_{:03}.ts", index);
            tokio::fs::write(job.output_dir.join(&filename), b"ts-segment").await?;
            segments.push(HlsSegment {
                index,
                filename,
                duration_seconds: duration,
            });
            remaining -= duration;
            index += 1;
        }
        Ok(segments)
    }

    async fn transcode_dash(&self, job: &TranscodeJob) -> Result<Vec<DashSegment>> {
        if self.fail_quality.as_deref() == Some(job.profile.name.as_str()) {
            return Err(PipelineError::TranscodeFailed(format!(
                "{}: synthetic encoder failure",
                job.profile.name
            )));
        }
        tokio::fs::create_dir_all(&job.output_dir).await?;
        tokio::fs::write(job.output_dir.join("init.mp4"), b"init").await?;
        let nominal_ms = job.segment_duration as u64 * 1000;
        let mut segments = Vec::new();
        let mut start_ms = 0u64;
        let mut remaining_ms = 30_000u64;
        let mut number = 1u32;
        while remaining_ms > 0 {
            let duration_ms = remaining_ms.min(nominal_ms);
            tokio::fs::write(
                job.output_dir.join(format!("segment-{}.m4s", number)),
                b"m4s",
            )
            .await?;
            segments.push(DashSegment {
                number,
                start_ms,
                duration_ms,
            });
            start_ms += duration_ms;
            remaining_ms -= duration_ms;
            number += 1;
        }
        Ok(segments)
    }
}

struct RecordingBus {
    events: Mutex<Vec<VideoEvent>>,
}

#[async_trait]
impl EventPublisher for RecordingBus {
    async fn publish(&self, _topic: &str, payload: Bytes) -> Result<()> {
        self.events
            .lock()
            .await
            .push(serde_json::from_slice(&payload)?);
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Fixture
// ----------------------------------------------------------------------

struct Fixture {
    _tmp: TempDir,
    store: Arc<VideoStore>,
    bus: Arc<RecordingBus>,
    orchestrator: PipelineOrchestrator,
}

async fn fixture(source_height: u32, fail_quality: Option<&str>) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let backend = LocalStore::new(tmp.path().join("raw"), tmp.path().join("processed"))
        .await
        .unwrap();
    let store = Arc::new(VideoStore::new(
        Arc::new(backend),
        Duration::from_secs(3600),
    ));
    let bus = Arc::new(RecordingBus {
        events: Mutex::new(Vec::new()),
    });
    let orchestrator = PipelineOrchestrator::new(
        Arc::clone(&store),
        Arc::new(MockProber {
            width: source_height * 16 / 9,
            height: source_height,
        }),
        Arc::new(MockThumbnailer),
        Arc::new(MockTranscoder {
            fail_quality: fail_quality.map(String::from),
        }),
        Arc::new(AllowAll),
        Arc::clone(&bus) as Arc<dyn EventPublisher>,
        Arc::new(NoopMetrics),
        Arc::new(IdLocks::new()),
        PipelineConfig {
            ladder: default_ladder(),
            hls_segment_duration: 6,
            dash_segment_duration: 4,
            skip_upscale: true,
            thumbnail_count: 3,
            extended_thumbnails: true,
            scratch_dir: Some(tmp.path().join("scratch")),
        },
    );
    Fixture {
        _tmp: tmp,
        store,
        bus,
        orchestrator,
    }
}

/// Store an uploaded record with its composed source and leftover chunks.
async fn seed_uploaded(store: &VideoStore) -> VideoRecord {
    let mut record = VideoRecord::new("clip.mp4", 9, "video/mp4", None, None, "alice", "acme");
    record.transition(VideoStatus::Uploading).unwrap();
    record.transition(VideoStatus::Uploaded).unwrap();
    let output = format!("videos/{}/clip.mp4", record.id);
    store
        .save_file(&output, Bytes::from_static(b"fake-mp4*"))
        .await
        .unwrap();
    store
        .save_chunk(record.id, 0, Bytes::from_static(b"fake-mp4*"))
        .await
        .unwrap();
    record.output_path = Some(output);
    record.chunks_received = 1;
    record.total_chunks = 1;
    record.upload_progress = 100.0;
    store.save_metadata(&record).await.unwrap();
    record
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

#[tokio::test]
async fn ladder_fan_out_produces_consistent_manifests() {
    let fx = fixture(720, None).await;
    let record = seed_uploaded(&fx.store).await;

    fx.orchestrator.process(record.id).await.unwrap();

    let ready = fx.store.get_metadata(record.id).await.unwrap();
    assert_eq!(ready.status, VideoStatus::Ready);
    assert!(ready.hls_master_url.is_some());
    assert!(ready.dash_mpd_url.is_some());
    assert_eq!(ready.playback_url, ready.hls_master_url);
    assert_eq!(ready.duration_seconds, Some(30.0));
    assert_eq!(ready.width, Some(1280));
    assert!(ready.thumbnail_url.is_some());

    // a 720p source with the default ladder yields exactly 4 variants
    let master = fx
        .store
        .get_file(&VideoStore::hls_master_path(record.id))
        .await
        .unwrap();
    let master = String::from_utf8(master.to_vec()).unwrap();
    let inf_lines: Vec<&str> = master
        .lines()
        .filter(|l| l.starts_with("#EXT-X-STREAM-INF"))
        .collect();
    assert_eq!(inf_lines.len(), 4);
    let bandwidths: Vec<u64> = inf_lines
        .iter()
        .map(|l| {
            l.split("BANDWIDTH=")
                .nth(1)
                .unwrap()
                .split(',')
                .next()
                .unwrap()
                .parse()
                .unwrap()
        })
        .collect();
    let mut sorted = bandwidths.clone();
    sorted.sort();
    assert_eq!(bandwidths, sorted, "variants must ascend by bandwidth");
    assert!(!master.contains("1080p"));

    let mpd = fx
        .store
        .get_file(&VideoStore::dash_mpd_path(record.id))
        .await
        .unwrap();
    let mpd = String::from_utf8(mpd.to_vec()).unwrap();
    assert_eq!(mpd.matches("<AdaptationSet").count(), 4);
    for width in ["426", "640", "854", "1280"] {
        assert!(mpd.contains(&format!("width=\"{}\"", width)), "missing width {}", width);
    }
    assert!(mpd.contains("type=\"static\""));
    assert!(mpd.contains("mediaPresentationDuration=\"PT30.000S\""));

    // variant playlists and segments landed in storage
    for quality in ["240p", "360p", "480p", "720p"] {
        let playlist = fx
            .store
            .get_file(&VideoStore::hls_variant_path(record.id, quality))
            .await
            .unwrap();
        let playlist = String::from_utf8(playlist.to_vec()).unwrap();
        assert!(playlist.contains("#EXT-X-TARGETDURATION:6"));
        assert!(playlist.ends_with("#EXT-X-ENDLIST"));
        assert!(fx
            .store
            .file_exists(&VideoStore::hls_segment_path(record.id, quality, "segment_000.ts"))
            .await
            .unwrap());
        assert!(fx
            .store
            .file_exists(&VideoStore::dash_init_path(record.id, quality))
            .await
            .unwrap());
        assert!(fx
            .store
            .file_exists(&VideoStore::dash_segment_path(record.id, quality, 1))
            .await
            .unwrap());
    }

    // thumbnails and extras
    assert!(fx
        .store
        .file_exists(&VideoStore::thumbnail_path(record.id))
        .await
        .unwrap());
    assert!(fx
        .store
        .file_exists(&VideoStore::thumbnail_still_path(record.id, 2))
        .await
        .unwrap());
    assert!(fx
        .store
        .file_exists(&VideoStore::poster_path(record.id))
        .await
        .unwrap());

    // chunk scratch removed on success
    assert!(!fx.store.chunks_exist(record.id).await.unwrap());

    // success event after the ready state
    let events = fx.bus.events.lock().await.clone();
    assert!(events.iter().any(|e| matches!(
        e,
        VideoEvent::VideoProcessed {
            status: ProcessedStatus::Success,
            ..
        }
    )));
}

#[tokio::test]
async fn transcode_failure_lands_in_error_state() {
    let fx = fixture(720, Some("480p")).await;
    let record = seed_uploaded(&fx.store).await;

    let err = fx.orchestrator.process(record.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::TranscodeFailed(_)));

    let failed = fx.store.get_metadata(record.id).await.unwrap();
    assert_eq!(failed.status, VideoStatus::Error);
    let message = failed.error_message.unwrap();
    assert!(message.contains("480p"));
    assert!(failed.hls_master_url.is_none());

    let events = fx.bus.events.lock().await.clone();
    assert!(events.iter().any(|e| matches!(
        e,
        VideoEvent::VideoProcessed {
            status: ProcessedStatus::Error,
            ..
        }
    )));
}

#[tokio::test]
async fn process_requires_uploaded_state() {
    let fx = fixture(720, None).await;
    let record = VideoRecord::new("p.mp4", 1, "video/mp4", None, None, "a", "c");
    fx.store.save_metadata(&record).await.unwrap();

    let err = fx.orchestrator.process(record.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::Conflict(_)));

    // a rejected claim leaves the record untouched
    let unchanged = fx.store.get_metadata(record.id).await.unwrap();
    assert_eq!(unchanged.status, VideoStatus::Pending);
}

#[tokio::test]
async fn retry_after_error_reaches_ready() {
    let fx = fixture(720, Some("360p")).await;
    let record = seed_uploaded(&fx.store).await;
    fx.orchestrator.process(record.id).await.unwrap_err();
    assert_eq!(
        fx.store.get_metadata(record.id).await.unwrap().status,
        VideoStatus::Error
    );

    // second fixture shares storage but transcodes cleanly
    let healthy = PipelineOrchestrator::new(
        Arc::clone(&fx.store),
        Arc::new(MockProber {
            width: 1280,
            height: 720,
        }),
        Arc::new(MockThumbnailer),
        Arc::new(MockTranscoder { fail_quality: None }),
        Arc::new(AllowAll),
        Arc::new(projectionist::events::NoopPublisher),
        Arc::new(NoopMetrics),
        Arc::new(IdLocks::new()),
        PipelineConfig {
            ladder: default_ladder(),
            hls_segment_duration: 6,
            dash_segment_duration: 4,
            skip_upscale: true,
            thumbnail_count: 1,
            extended_thumbnails: false,
            scratch_dir: None,
        },
    );
    healthy.retry(record.id).await.unwrap();

    let ready = fx.store.get_metadata(record.id).await.unwrap();
    assert_eq!(ready.status, VideoStatus::Ready);
    assert!(ready.error_message.is_none());
}

#[tokio::test]
async fn cancel_marker_stops_the_run() {
    let fx = fixture(720, None).await;
    let record = seed_uploaded(&fx.store).await;

    // owner cancelled between enqueue and pick-up
    let mut marked = fx.store.get_metadata(record.id).await.unwrap();
    marked.cleanup_eligible_at = Some(chrono::Utc::now());
    fx.store.save_metadata(&marked).await.unwrap();

    let err = fx.orchestrator.process(record.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::Conflict(_)));

    let stopped = fx.store.get_metadata(record.id).await.unwrap();
    assert_eq!(stopped.status, VideoStatus::Error);
    assert!(stopped.error_message.unwrap().contains("cancelled"));
    assert!(stopped.cleanup_eligible_at.is_some());
}
