//! Lifecycle event publication
//!
//! Events announce state transitions to the rest of the platform over the
//! bus. Publication is best-effort and always happens after the record is
//! persisted, so observers can never race ahead of durable state.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::NatsArgs;
use crate::types::{PipelineError, Result};

/// Topic for lifecycle events
pub const TOPIC_VIDEO_EVENTS: &str = "video-events";
/// Topic for analytics/metrics samples
pub const TOPIC_VIDEO_ANALYTICS: &str = "video-analytics";

/// Default ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// Messages on the `video-events` topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum VideoEvent {
    VideoUploaded {
        video_id: Uuid,
        user_id: String,
        company_id: String,
        timestamp: DateTime<Utc>,
    },
    VideoProcessed {
        video_id: Uuid,
        status: ProcessedStatus,
        timestamp: DateTime<Utc>,
    },
    VideoView {
        video_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        company_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessedStatus {
    Success,
    Error,
}

impl VideoEvent {
    pub fn uploaded(video_id: Uuid, user_id: &str, company_id: &str) -> Self {
        Self::VideoUploaded {
            video_id,
            user_id: user_id.to_string(),
            company_id: company_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn processed(video_id: Uuid, status: ProcessedStatus) -> Self {
        Self::VideoProcessed {
            video_id,
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn view(video_id: Uuid, user_id: Option<&str>, company_id: Option<&str>) -> Self {
        Self::VideoView {
            video_id,
            user_id: user_id.map(String::from),
            company_id: company_id.map(String::from),
            timestamp: Utc::now(),
        }
    }

    pub fn video_id(&self) -> Uuid {
        match self {
            Self::VideoUploaded { video_id, .. }
            | Self::VideoProcessed { video_id, .. }
            | Self::VideoView { video_id, .. } => *video_id,
        }
    }
}

/// Bus publisher seam; tests inject a recording stub.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    async fn publish_event(&self, event: &VideoEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        self.publish(TOPIC_VIDEO_EVENTS, Bytes::from(payload)).await
    }
}

/// NATS-backed publisher
#[derive(Clone)]
pub struct NatsEventBus {
    client: async_nats::Client,
}

impl NatsEventBus {
    pub async fn connect(args: &NatsArgs, name: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", args.nats_url);

        let mut options = async_nats::ConnectOptions::new()
            .name(name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(Duration::from_secs(5));

        if let (Some(user), Some(pass)) = (&args.nats_user, &args.nats_password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }

        let client = options
            .connect(&args.nats_url)
            .await
            .map_err(|e| PipelineError::EventBus(format!("Failed to connect: {}", e)))?;

        info!("Connected to NATS at {}", args.nats_url);
        Ok(Self { client })
    }

    pub fn inner(&self) -> &async_nats::Client {
        &self.client
    }

    pub async fn subscribe(&self, subject: &str) -> Result<async_nats::Subscriber> {
        self.client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| PipelineError::EventBus(format!("Subscribe failed: {}", e)))
    }

    pub async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| PipelineError::EventBus(format!("Flush failed: {}", e)))
    }
}

#[async_trait]
impl EventPublisher for NatsEventBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(topic.to_string(), payload)
            .await
            .map_err(|e| PipelineError::EventBus(format!("Publish failed: {}", e)))
    }
}

/// Publisher that drops everything; for tests and dry runs.
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, _topic: &str, _payload: Bytes) -> Result<()> {
        Ok(())
    }
}

/// Publish an event, logging instead of failing; callers have already
/// persisted the state the event announces.
pub async fn publish_best_effort(publisher: &dyn EventPublisher, event: &VideoEvent) {
    if let Err(e) = publisher.publish_event(event).await {
        warn!(video_id = %event.video_id(), error = %e, "event publication failed");
    }
}
