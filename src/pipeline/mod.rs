//! Per-video processing pipeline
//!
//! Drives one video from `uploaded` to `ready`: stage the source locally,
//! probe it, cut thumbnails, fan the transcode ladder out across tasks,
//! upload the segment sets, emit manifests, and persist playback URLs.
//! The `processing` state is persisted before any work starts so the
//! janitor can recognize a stalled run, and every failure between claim
//! and completion lands the record in `error` with the cause attached.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::authz::VideoAuthz;
use crate::events::{publish_best_effort, EventPublisher, ProcessedStatus, VideoEvent};
use crate::locks::IdLocks;
use crate::manifest::{dash, hls, AdaptationSet, VariantStream};
use crate::media::{MediaProber, MediaTranscoder, ThumbnailMaker, TranscodeJob};
use crate::metrics::{MetricKey, MetricsSink};
use crate::storage::VideoStore;
use crate::types::{
    DashSegment, HlsSegment, PipelineError, QualityProfile, Result, StreamFormat, VideoRecord,
    VideoStatus,
};

/// Seconds of animated preview
const PREVIEW_SECONDS: u32 = 3;
/// Cap on the error message persisted to the record
const MAX_ERROR_LEN: usize = 500;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub ladder: Vec<QualityProfile>,
    pub hls_segment_duration: u32,
    pub dash_segment_duration: u32,
    pub skip_upscale: bool,
    pub thumbnail_count: u32,
    pub extended_thumbnails: bool,
    /// Parent for per-run scratch directories; system temp when unset
    pub scratch_dir: Option<PathBuf>,
}

pub struct PipelineOrchestrator {
    store: Arc<VideoStore>,
    prober: Arc<dyn MediaProber>,
    thumbnailer: Arc<dyn ThumbnailMaker>,
    transcoder: Arc<dyn MediaTranscoder>,
    authz: Arc<dyn VideoAuthz>,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<dyn MetricsSink>,
    locks: Arc<IdLocks>,
    config: PipelineConfig,
}

/// Segment sets gathered from the fan-out, keyed by quality name
#[derive(Default)]
struct LadderOutput {
    hls: HashMap<String, (PathBuf, Vec<HlsSegment>)>,
    dash: HashMap<String, (PathBuf, Vec<DashSegment>)>,
}

enum TranscodeOutcome {
    Hls(QualityProfile, PathBuf, Vec<HlsSegment>),
    Dash(QualityProfile, PathBuf, Vec<DashSegment>),
}

impl PipelineOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<VideoStore>,
        prober: Arc<dyn MediaProber>,
        thumbnailer: Arc<dyn ThumbnailMaker>,
        transcoder: Arc<dyn MediaTranscoder>,
        authz: Arc<dyn VideoAuthz>,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<dyn MetricsSink>,
        locks: Arc<IdLocks>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            prober,
            thumbnailer,
            transcoder,
            authz,
            events,
            metrics,
            locks,
            config,
        }
    }

    /// Run the full pipeline for one uploaded video.
    pub async fn process(&self, video_id: Uuid) -> Result<()> {
        let started = Instant::now();

        // claim the record; `processing` must be durable before any work
        let record = self
            .mutate_record(video_id, |record| {
                if record.status != VideoStatus::Uploaded {
                    return Err(PipelineError::Conflict(format!(
                        "video {} is {}, expected uploaded",
                        record.id, record.status
                    )));
                }
                record.transition(VideoStatus::Processing)
            })
            .await?;

        info!(video_id = %video_id, "processing started");

        match self.run_stages(&record).await {
            Ok(()) => {
                let elapsed = started.elapsed().as_millis() as u64;
                self.metrics
                    .timing(
                        "processing_time",
                        elapsed,
                        MetricKey {
                            user_id: Some(&record.owner_id),
                            company_id: Some(&record.company_id),
                            video_id: Some(video_id),
                        },
                    )
                    .await;
                info!(video_id = %video_id, elapsed_ms = elapsed, "processing complete");
                Ok(())
            }
            Err(e) => {
                error!(video_id = %video_id, error = %e, "processing failed");
                self.mark_error(video_id, &e).await;
                publish_best_effort(
                    self.events.as_ref(),
                    &VideoEvent::processed(video_id, ProcessedStatus::Error),
                )
                .await;
                Err(e)
            }
        }
    }

    /// Reset a failed video and run it again.
    pub async fn retry(&self, video_id: Uuid) -> Result<()> {
        self.mutate_record(video_id, |record| {
            if record.status != VideoStatus::Error {
                return Err(PipelineError::Conflict(format!(
                    "cannot retry video in state {}",
                    record.status
                )));
            }
            record.transition(VideoStatus::Pending)?;
            record.error_message = None;
            // the composed source survives a processing failure, so the
            // upload phase does not need to repeat
            if record.output_path.is_some() {
                record.transition(VideoStatus::Uploaded)?;
            }
            Ok(())
        })
        .await?;
        self.process(video_id).await
    }

    // ------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------

    async fn run_stages(&self, claimed: &VideoRecord) -> Result<()> {
        let video_id = claimed.id;
        let scratch = self.make_scratch()?;

        // stage the composed source locally
        let source_path = claimed.output_path.clone().ok_or_else(|| {
            PipelineError::Internal(format!("video {} has no composed source", video_id))
        })?;
        let local_source = scratch.path().join(claimed.basename());
        let source_bytes = self.store.get_file(&source_path).await?;
        tokio::fs::write(&local_source, &source_bytes).await?;
        drop(source_bytes);

        // probe and persist the measured facts
        let probe = self.prober.probe(&local_source).await?;
        self.mutate_record(video_id, |record| {
            record.duration_seconds = Some(probe.duration_seconds);
            record.width = Some(probe.width);
            record.height = Some(probe.height);
            record.bitrate_bps = Some(probe.bitrate_bps);
            record.container_format = Some(probe.container_format.clone());
            record.video_codec = probe.video_codec.clone();
            record.audio_codec = probe.audio_codec.clone();
            Ok(())
        })
        .await?;
        if probe.issues.audio.silent {
            warn!(video_id = %video_id, "source audio appears silent");
        }

        self.check_cancelled(video_id).await?;

        // thumbnails
        let thumbnail_url = self
            .generate_thumbnails(video_id, &local_source, scratch.path())
            .await?;

        // transcode fan-out
        let ladder = select_ladder(&self.config.ladder, probe.height, self.config.skip_upscale);
        let output = self
            .fan_out_transcodes(&local_source, scratch.path(), &ladder)
            .await?;

        self.check_cancelled(video_id).await?;

        // push segments, then manifests
        self.upload_segments(video_id, &output).await?;
        self.emit_manifests(video_id, &ladder, &output, probe.duration_seconds)
            .await?;

        // playback URLs
        let hls_url = self.store.presign_hls(video_id).await?;
        let dash_url = self.store.presign_dash(video_id).await?;

        let record = self
            .mutate_record(video_id, |record| {
                record.transition(VideoStatus::Ready)?;
                record.thumbnail_url = thumbnail_url.clone();
                record.hls_master_url = Some(hls_url.clone());
                record.dash_mpd_url = Some(dash_url.clone());
                record.playback_url = Some(hls_url.clone());
                Ok(())
            })
            .await?;

        // chunk scratch is no longer needed once the record is ready; the
        // janitor covers this if the process dies first
        if let Err(e) = self
            .store
            .delete_prefix(&VideoStore::chunks_prefix(video_id))
            .await
        {
            warn!(video_id = %video_id, error = %e, "chunk cleanup failed");
        }

        self.notify_ready(&record).await;
        publish_best_effort(
            self.events.as_ref(),
            &VideoEvent::processed(video_id, ProcessedStatus::Success),
        )
        .await;
        Ok(())
    }

    async fn generate_thumbnails(
        &self,
        video_id: Uuid,
        source: &Path,
        scratch: &Path,
    ) -> Result<Option<String>> {
        let thumbs_dir = scratch.join("thumbnails");
        let stills = self
            .thumbnailer
            .stills(source, &thumbs_dir, self.config.thumbnail_count)
            .await?;

        for (i, still) in stills.iter().enumerate() {
            let data = tokio::fs::read(still).await?;
            self.store
                .save_file(
                    &VideoStore::thumbnail_still_path(video_id, i as u32),
                    data.into(),
                )
                .await?;
        }
        if let Some(first) = stills.first() {
            let data = tokio::fs::read(first).await?;
            self.store
                .save_file(&VideoStore::thumbnail_path(video_id), data.into())
                .await?;
        }

        if self.config.extended_thumbnails {
            // both are cosmetic extras; neither may fail the stage
            let poster = scratch.join("poster.jpg");
            match self.thumbnailer.poster(source, &poster).await {
                Ok(()) => {
                    let data = tokio::fs::read(&poster).await?;
                    self.store
                        .save_file(&VideoStore::poster_path(video_id), data.into())
                        .await?;
                }
                Err(e) => warn!(video_id = %video_id, error = %e, "poster generation failed"),
            }

            let preview = scratch.join("preview.gif");
            match self
                .thumbnailer
                .animated(source, &preview, PREVIEW_SECONDS)
                .await
            {
                Ok(()) => {
                    let data = tokio::fs::read(&preview).await?;
                    self.store
                        .save_file(&VideoStore::preview_path(video_id), data.into())
                        .await?;
                }
                Err(e) => warn!(video_id = %video_id, error = %e, "animated preview failed"),
            }
        }

        if stills.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            self.store
                .presign_file(&VideoStore::thumbnail_path(video_id))
                .await?,
        ))
    }

    /// One task per (quality, format); the first failure aborts the rest.
    async fn fan_out_transcodes(
        &self,
        source: &Path,
        scratch: &Path,
        ladder: &[QualityProfile],
    ) -> Result<LadderOutput> {
        let mut tasks: JoinSet<Result<TranscodeOutcome>> = JoinSet::new();

        for profile in ladder {
            for format in [StreamFormat::Hls, StreamFormat::Dash] {
                let transcoder = Arc::clone(&self.transcoder);
                let job = TranscodeJob {
                    source: source.to_path_buf(),
                    output_dir: scratch.join(format.to_string()).join(&profile.name),
                    profile: profile.clone(),
                    segment_duration: match format {
                        StreamFormat::Hls => self.config.hls_segment_duration,
                        StreamFormat::Dash => self.config.dash_segment_duration,
                    },
                };
                tasks.spawn(async move {
                    match format {
                        StreamFormat::Hls => {
                            let segments = transcoder.transcode_hls(&job).await?;
                            Ok(TranscodeOutcome::Hls(
                                job.profile.clone(),
                                job.output_dir.clone(),
                                segments,
                            ))
                        }
                        StreamFormat::Dash => {
                            let segments = transcoder.transcode_dash(&job).await?;
                            Ok(TranscodeOutcome::Dash(
                                job.profile.clone(),
                                job.output_dir.clone(),
                                segments,
                            ))
                        }
                    }
                });
            }
        }

        let mut output = LadderOutput::default();
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(result) => result,
                Err(e) => {
                    tasks.abort_all();
                    return Err(PipelineError::Internal(format!("transcode task died: {}", e)));
                }
            };
            match outcome {
                Ok(TranscodeOutcome::Hls(profile, dir, segments)) => {
                    output.hls.insert(profile.name.clone(), (dir, segments));
                }
                Ok(TranscodeOutcome::Dash(profile, dir, segments)) => {
                    output.dash.insert(profile.name.clone(), (dir, segments));
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }
        Ok(output)
    }

    async fn upload_segments(&self, video_id: Uuid, output: &LadderOutput) -> Result<()> {
        for (quality, (dir, segments)) in &output.hls {
            for segment in segments {
                let data = tokio::fs::read(dir.join(&segment.filename)).await?;
                self.store
                    .save_file(
                        &VideoStore::hls_segment_path(video_id, quality, &segment.filename),
                        data.into(),
                    )
                    .await?;
            }
        }
        for (quality, (dir, segments)) in &output.dash {
            let init = tokio::fs::read(dir.join("init.mp4")).await?;
            self.store
                .save_file(&VideoStore::dash_init_path(video_id, quality), init.into())
                .await?;
            for segment in segments {
                let data =
                    tokio::fs::read(dir.join(format!("segment-{}.m4s", segment.number))).await?;
                self.store
                    .save_file(
                        &VideoStore::dash_segment_path(video_id, quality, segment.number),
                        data.into(),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn emit_manifests(
        &self,
        video_id: Uuid,
        ladder: &[QualityProfile],
        output: &LadderOutput,
        duration_seconds: f64,
    ) -> Result<()> {
        for (quality, (_, segments)) in &output.hls {
            let playlist = hls::variant_playlist(segments);
            self.store
                .save_file(
                    &VideoStore::hls_variant_path(video_id, quality),
                    playlist.into_bytes().into(),
                )
                .await?;
        }

        let variants: Vec<VariantStream> = ladder
            .iter()
            .filter(|p| output.hls.contains_key(&p.name))
            .map(|p| VariantStream {
                name: p.name.clone(),
                bandwidth: p.bandwidth_bps(),
                resolution: p.resolution.clone(),
            })
            .collect();
        let master = hls::master_playlist(&variants);
        self.store
            .save_file(
                &VideoStore::hls_master_path(video_id),
                master.into_bytes().into(),
            )
            .await?;

        let adaptations: Vec<AdaptationSet> = ladder
            .iter()
            .filter_map(|p| {
                output.dash.get(&p.name).map(|(_, segments)| AdaptationSet {
                    id: format!("video_{}", p.name),
                    mime_type: "video/mp4".to_string(),
                    codecs: p.codec_string.clone(),
                    width: p.width(),
                    height: p.height(),
                    bandwidth: p.bandwidth_bps(),
                    segment_timeline: Some(segments.clone()),
                    start_number: 1,
                })
            })
            .collect();
        let mpd = dash::static_mpd(
            &adaptations,
            duration_seconds,
            self.config.dash_segment_duration as u64 * 1000,
        );
        self.store
            .save_file(&VideoStore::dash_mpd_path(video_id), mpd.into_bytes().into())
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    async fn mutate_record<F>(&self, video_id: Uuid, mutate: F) -> Result<VideoRecord>
    where
        F: FnOnce(&mut VideoRecord) -> Result<()>,
    {
        let _guard = self.locks.acquire(video_id).await;
        let mut record = match self.store.get_metadata(video_id).await {
            Ok(record) => record,
            Err(PipelineError::NotFound(_)) => {
                return Err(PipelineError::VideoNotFound(video_id.to_string()))
            }
            Err(e) => return Err(e),
        };
        mutate(&mut record)?;
        record.touch();
        self.store.save_metadata(&record).await?;
        Ok(record)
    }

    async fn mark_error(&self, video_id: Uuid, cause: &PipelineError) {
        let message = cause.truncated_cause(MAX_ERROR_LEN);
        let result = self
            .mutate_record(video_id, |record| {
                if record.status == VideoStatus::Processing {
                    record.transition(VideoStatus::Error)?;
                }
                record.error_message = Some(message.clone());
                Ok(())
            })
            .await;
        if let Err(e) = result {
            error!(video_id = %video_id, error = %e, "failed to persist error state");
        }

        let mut fields = HashMap::new();
        fields.insert("status".to_string(), serde_json::json!("error"));
        fields.insert("error".to_string(), serde_json::json!(message));
        if let Err(e) = self.authz.update_video_metadata(video_id, &fields).await {
            warn!(video_id = %video_id, error = %e, "platform error notification failed");
        }
    }

    /// An owner cancel during processing stops the run between stages.
    async fn check_cancelled(&self, video_id: Uuid) -> Result<()> {
        let record = self.store.get_metadata(video_id).await?;
        if record.cleanup_eligible_at.is_some() {
            return Err(PipelineError::Conflict(format!(
                "video {} was cancelled during processing",
                video_id
            )));
        }
        Ok(())
    }

    /// Tell the platform playback is ready. One retry on timeout, per the
    /// notification policy; any other failure is logged and dropped.
    async fn notify_ready(&self, record: &VideoRecord) {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), serde_json::json!("ready"));
        fields.insert(
            "duration".to_string(),
            serde_json::json!(record.duration_seconds),
        );
        fields.insert("width".to_string(), serde_json::json!(record.width));
        fields.insert("height".to_string(), serde_json::json!(record.height));
        fields.insert(
            "thumbnail_url".to_string(),
            serde_json::json!(record.thumbnail_url),
        );
        fields.insert(
            "playback_url".to_string(),
            serde_json::json!(record.playback_url),
        );
        if let Err(e) = self.authz.update_video_metadata(record.id, &fields).await {
            warn!(video_id = %record.id, error = %e, "platform metadata push failed");
        }

        let mut attempt = self.authz.notify_video_ready(record.id, &record.owner_id).await;
        if matches!(attempt, Err(PipelineError::UpstreamTimeout(_))) {
            attempt = self.authz.notify_video_ready(record.id, &record.owner_id).await;
        }
        if let Err(e) = attempt {
            warn!(video_id = %record.id, error = %e, "owner notification failed");
        }
    }

    fn make_scratch(&self) -> Result<tempfile::TempDir> {
        let scratch = match &self.config.scratch_dir {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                tempfile::Builder::new()
                    .prefix("video-pipeline-")
                    .tempdir_in(root)?
            }
            None => tempfile::Builder::new()
                .prefix("video-pipeline-")
                .tempdir()?,
        };
        Ok(scratch)
    }
}

/// Drop ladder rungs that would upscale past the probed source height.
/// The smallest rung always survives so every video gets at least one
/// variant.
pub fn select_ladder(
    ladder: &[QualityProfile],
    source_height: u32,
    skip_upscale: bool,
) -> Vec<QualityProfile> {
    if !skip_upscale || source_height == 0 {
        return ladder.to_vec();
    }
    let kept: Vec<QualityProfile> = ladder
        .iter()
        .filter(|p| p.height() <= source_height)
        .cloned()
        .collect();
    if kept.is_empty() {
        ladder
            .iter()
            .min_by_key(|p| p.height())
            .cloned()
            .into_iter()
            .collect()
    } else {
        kept
    }
}
