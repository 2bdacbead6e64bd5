//! Progress fan-out over broker pub/sub channels.
//!
//! Events are ephemeral: a subscriber only sees events published while it is
//! connected. Read the pipeline snapshot first, then apply live events on top.

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::Result;
use crate::broker::Broker;
use crate::database::models::{PipelineDbModel, PipelineStatus};
use crate::utils::json::{self, JsonContext};

/// A just-occurred pipeline state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub pipeline_id: String,
    pub status: PipelineStatus,
    pub progress: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(pipeline_id: impl Into<String>, status: PipelineStatus, progress: i64) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            status,
            progress,
            stage: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Event reflecting the persisted state of `pipeline`.
    pub fn from_record(pipeline: &PipelineDbModel) -> Self {
        Self {
            pipeline_id: pipeline.id.clone(),
            status: pipeline.status,
            progress: pipeline.progress,
            stage: pipeline.current_stage.clone(),
            error: pipeline.error.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Publishes progress events to a per-pipeline channel and a global channel.
pub struct ProgressBroadcaster {
    broker: Arc<dyn Broker>,
    key_prefix: String,
}

impl ProgressBroadcaster {
    pub fn new(broker: Arc<dyn Broker>, key_prefix: impl Into<String>) -> Self {
        Self {
            broker,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn pipeline_channel(&self, pipeline_id: &str) -> String {
        format!("{}:progress:{}", self.key_prefix, pipeline_id)
    }

    pub fn global_channel(&self) -> String {
        format!("{}:progress:all", self.key_prefix)
    }

    /// Deliver `event` to the pipeline's channel, then to the global channel.
    ///
    /// Best effort: failures are logged and never returned.
    pub async fn publish(&self, pipeline_id: &str, event: &ProgressEvent) {
        let channel = self.pipeline_channel(pipeline_id);
        let payload = json::to_string_or_fallback(
            event,
            "",
            JsonContext::ProgressPayload { channel: &channel },
            "Failed to encode progress event",
        );
        if payload.is_empty() {
            return;
        }

        for channel in [channel, self.global_channel()] {
            match self.broker.publish(&channel, payload.clone()).await {
                Ok(receivers) => {
                    debug!(
                        pipeline_id = %pipeline_id,
                        channel = %channel,
                        receivers,
                        status = %event.status,
                        progress = event.progress,
                        "Published progress event"
                    );
                }
                Err(e) => {
                    warn!(
                        pipeline_id = %pipeline_id,
                        channel = %channel,
                        error = %e,
                        "Failed to publish progress event"
                    );
                }
            }
        }
    }

    /// Receive future events for one pipeline.
    pub async fn subscribe(&self, pipeline_id: &str) -> Result<ProgressSubscription> {
        let channel = self.pipeline_channel(pipeline_id);
        let rx = self.broker.subscribe(&channel).await?;
        Ok(ProgressSubscription::new(channel, rx, self.broker.clone()))
    }

    /// Receive future events for every pipeline.
    pub async fn subscribe_all(&self) -> Result<ProgressSubscription> {
        let channel = self.global_channel();
        let rx = self.broker.subscribe(&channel).await?;
        Ok(ProgressSubscription::new(channel, rx, self.broker.clone()))
    }

    /// Stop receiving events. Equivalent to dropping the subscription.
    pub fn unsubscribe(&self, subscription: ProgressSubscription) {
        debug!(channel = %subscription.channel, "Unsubscribed from progress channel");
        drop(subscription);
    }
}

/// A live progress feed the caller iterates.
///
/// Dropping it releases the broker channel once no other subscriber remains.
pub struct ProgressSubscription {
    channel: String,
    rx: Option<broadcast::Receiver<String>>,
    broker: Arc<dyn Broker>,
}

impl ProgressSubscription {
    fn new(channel: String, rx: broadcast::Receiver<String>, broker: Arc<dyn Broker>) -> Self {
        Self {
            channel,
            rx: Some(rx),
            broker,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next event. Returns `None` once the broker shuts down.
    ///
    /// Malformed payloads are logged and skipped. A subscriber that falls
    /// behind loses the overflowed events and keeps receiving newer ones.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(payload) => {
                    let event = json::parse_optional::<ProgressEvent>(
                        Some(&payload),
                        JsonContext::ProgressPayload {
                            channel: &self.channel,
                        },
                        "Dropping malformed progress payload",
                    );
                    if let Some(event) = event {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        channel = %self.channel,
                        skipped,
                        "Progress subscriber lagged; events dropped"
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Convert into a `Stream` of events.
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

impl Drop for ProgressSubscription {
    fn drop(&mut self) {
        // The receiver must be gone before the broker checks the channel's count.
        self.rx.take();
        self.broker.unsubscribe(&self.channel);
    }
}
