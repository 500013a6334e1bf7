//! Projectionist service binary
//!
//! Subscribes to the `video-events` topic and runs the processing
//! pipeline for every uploaded video, with the janitor sweeping on its
//! own cadence.
//!
//! Usage:
//!   projectionist --storage-backend local --nats-url nats://localhost:4222
//!
//! Environment variables mirror every flag; see `--help`.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures_util::StreamExt;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use projectionist::authz::{AllowAll, HttpAuthz, VideoAuthz};
use projectionist::config::Args;
use projectionist::events::{EventPublisher, NatsEventBus, VideoEvent, TOPIC_VIDEO_EVENTS};
use projectionist::janitor::{Janitor, JanitorConfig};
use projectionist::locks::IdLocks;
use projectionist::media::{FfmpegThumbnailer, FfmpegTranscoder, FfprobeProber};
use projectionist::metrics::BusMetrics;
use projectionist::pipeline::{PipelineConfig, PipelineOrchestrator};
use projectionist::storage::{build_backend, VideoStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{},projectionist=debug", args.log_level))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        anyhow::bail!("invalid configuration: {}", e);
    }

    let backend = build_backend(&args).await.context("storage backend")?;
    let store = Arc::new(VideoStore::new(backend, args.presign_ttl()));
    let locks = Arc::new(IdLocks::new());

    let bus = NatsEventBus::connect(&args.nats, "projectionist")
        .await
        .context("event bus")?;
    let events: Arc<dyn EventPublisher> = Arc::new(bus.clone());
    let metrics = Arc::new(BusMetrics::new(Arc::clone(&events)));

    let authz: Arc<dyn VideoAuthz> = match &args.authz_url {
        Some(url) => Arc::new(HttpAuthz::new(
            url,
            args.authz_service_token.as_deref(),
            args.upstream_timeout(),
        )?),
        None => {
            warn!("no AUTHZ_URL configured, running with permissive authorization");
            Arc::new(AllowAll)
        }
    };

    let ladder = args.ladder().map_err(|e| anyhow::anyhow!(e))?;
    let orchestrator = Arc::new(PipelineOrchestrator::new(
        Arc::clone(&store),
        Arc::new(FfprobeProber::new(
            &args.ffprobe_path,
            &args.ffmpeg_path,
            args.tool_timeout(),
            args.allowed_formats(),
        )),
        Arc::new(FfmpegThumbnailer::new(
            &args.ffmpeg_path,
            &args.ffprobe_path,
            args.tool_timeout(),
        )),
        Arc::new(FfmpegTranscoder::new(
            &args.ffmpeg_path,
            &args.ffprobe_path,
            args.transcoder_threads_per_job,
            args.tool_timeout(),
        )),
        Arc::clone(&authz),
        Arc::clone(&events),
        metrics,
        Arc::clone(&locks),
        PipelineConfig {
            ladder,
            hls_segment_duration: args.hls_segment_duration_s,
            dash_segment_duration: args.dash_segment_duration_s,
            skip_upscale: args.skip_upscale,
            thumbnail_count: args.thumbnail_count,
            extended_thumbnails: args.extended_thumbnails,
            scratch_dir: args.scratch_dir.clone(),
        },
    ));

    let janitor = Janitor::new(
        Arc::clone(&store),
        Arc::clone(&authz),
        Arc::clone(&locks),
        JanitorConfig {
            stall_hours: args.stall_hours,
            expiration_days: args.expiration_days,
            interval: std::time::Duration::from_secs(args.janitor_interval_secs),
        },
    );
    let janitor_handle = tokio::spawn(async move { janitor.run().await });

    let dispatcher = tokio::spawn(dispatch_uploads(
        bus,
        orchestrator,
        args.max_concurrent_jobs,
    ));

    info!("projectionist started");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        result = dispatcher => {
            if let Err(e) = result {
                error!("dispatcher task error: {}", e);
            }
        }
    }

    janitor_handle.abort();
    info!("projectionist shutting down");
    Ok(())
}

/// Pull `video_uploaded` events off the bus and run the pipeline for each,
/// capped at `max_concurrent` videos in flight.
async fn dispatch_uploads(
    bus: NatsEventBus,
    orchestrator: Arc<PipelineOrchestrator>,
    max_concurrent: usize,
) {
    let mut subscriber = match bus.subscribe(TOPIC_VIDEO_EVENTS).await {
        Ok(subscriber) => subscriber,
        Err(e) => {
            error!(error = %e, "failed to subscribe to upload events");
            return;
        }
    };
    let permits = Arc::new(Semaphore::new(max_concurrent));
    info!(
        topic = TOPIC_VIDEO_EVENTS,
        max_concurrent, "listening for uploaded videos"
    );

    while let Some(message) = subscriber.next().await {
        let event: VideoEvent = match serde_json::from_slice(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "unreadable event payload");
                continue;
            }
        };
        let video_id = match event {
            VideoEvent::VideoUploaded { video_id, .. } => video_id,
            // processed/view events are produced by this service, not consumed
            _ => continue,
        };

        let permit = match Arc::clone(&permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if let Err(e) = orchestrator.process(video_id).await {
                error!(video_id = %video_id, error = %e, "pipeline run failed");
            }
            drop(permit);
        });
    }
}
