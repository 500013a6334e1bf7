//! Metrics sink
//!
//! Counters and timing samples keyed per user/company, shipped to the
//! analytics topic. The sink is fire-and-forget: a metrics failure is
//! logged and never propagates into the pipeline.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::events::{EventPublisher, TOPIC_VIDEO_ANALYTICS};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "sample_type", rename_all = "snake_case")]
enum Sample<'a> {
    Counter {
        name: &'a str,
        value: u64,
        user_id: Option<&'a str>,
        company_id: Option<&'a str>,
        video_id: Option<Uuid>,
        timestamp: chrono::DateTime<Utc>,
    },
    Timing {
        name: &'a str,
        millis: u64,
        user_id: Option<&'a str>,
        company_id: Option<&'a str>,
        video_id: Option<Uuid>,
        timestamp: chrono::DateTime<Utc>,
    },
}

/// Identity labels attached to a sample
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricKey<'a> {
    pub user_id: Option<&'a str>,
    pub company_id: Option<&'a str>,
    pub video_id: Option<Uuid>,
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn incr(&self, name: &str, value: u64, key: MetricKey<'_>);
    async fn timing(&self, name: &str, millis: u64, key: MetricKey<'_>);
}

/// Publishes samples to the analytics topic on the event bus
pub struct BusMetrics {
    publisher: Arc<dyn EventPublisher>,
}

impl BusMetrics {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self { publisher }
    }

    async fn send(&self, sample: &Sample<'_>) {
        let payload = match serde_json::to_vec(sample) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode metrics sample");
                return;
            }
        };
        if let Err(e) = self
            .publisher
            .publish(TOPIC_VIDEO_ANALYTICS, Bytes::from(payload))
            .await
        {
            warn!(error = %e, "failed to publish metrics sample");
        }
    }
}

#[async_trait]
impl MetricsSink for BusMetrics {
    async fn incr(&self, name: &str, value: u64, key: MetricKey<'_>) {
        self.send(&Sample::Counter {
            name,
            value,
            user_id: key.user_id,
            company_id: key.company_id,
            video_id: key.video_id,
            timestamp: Utc::now(),
        })
        .await;
    }

    async fn timing(&self, name: &str, millis: u64, key: MetricKey<'_>) {
        self.send(&Sample::Timing {
            name,
            millis,
            user_id: key.user_id,
            company_id: key.company_id,
            video_id: key.video_id,
            timestamp: Utc::now(),
        })
        .await;
    }
}

/// Sink that drops everything; for tests.
pub struct NoopMetrics;

#[async_trait]
impl MetricsSink for NoopMetrics {
    async fn incr(&self, _name: &str, _value: u64, _key: MetricKey<'_>) {}
    async fn timing(&self, _name: &str, _millis: u64, _key: MetricKey<'_>) {}
}
