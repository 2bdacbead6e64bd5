//! Three-lane priority queue of job references stored in broker lists.
//!
//! Lanes are served strictly in `high -> normal -> low` order and FIFO within a
//! lane. A continuous stream of high-priority work can therefore starve the
//! lower lanes indefinitely; this is intended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::Result;
use crate::broker::Broker;
use crate::utils::json::{self, JsonContext};

/// Priority class of a queued job.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Every lane in dequeue order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    fn lane_index(&self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

/// Lightweight queue entry pointing at a pipeline record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReference {
    pub job_id: String,
    pub pipeline_id: String,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

impl JobReference {
    pub fn new(
        job_id: impl Into<String>,
        pipeline_id: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            pipeline_id: pipeline_id.into(),
            priority,
            enqueued_at: Utc::now(),
        }
    }
}

/// Configuration for the priority queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Namespace for lane keys (`{prefix}:queue:{lane}`).
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Warning threshold for total queue depth.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: usize,
    /// Critical threshold for total queue depth.
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: usize,
}

fn default_key_prefix() -> String {
    "forge".to_string()
}

fn default_warning_threshold() -> usize {
    100
}

fn default_critical_threshold() -> usize {
    500
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            warning_threshold: default_warning_threshold(),
            critical_threshold: default_critical_threshold(),
        }
    }
}

/// Status of queue depth, used for admission control upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueDepthStatus {
    /// Queue depth is normal.
    Normal,
    /// Queue depth is at warning level.
    Warning,
    /// Queue depth is at critical level.
    Critical,
}

/// Priority queue over three broker lists.
pub struct PriorityQueue {
    broker: Arc<dyn Broker>,
    config: QueueConfig,
    /// Lane keys in dequeue order.
    lanes: Vec<String>,
}

impl PriorityQueue {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_config(broker, QueueConfig::default())
    }

    pub fn with_config(broker: Arc<dyn Broker>, config: QueueConfig) -> Self {
        let lanes = Priority::ALL
            .iter()
            .map(|p| format!("{}:queue:{}", config.key_prefix, p.as_str()))
            .collect();
        Self {
            broker,
            config,
            lanes,
        }
    }

    fn lane_key(&self, priority: Priority) -> &str {
        &self.lanes[priority.lane_index()]
    }

    /// Append a job reference to the tail of its lane.
    pub async fn enqueue(
        &self,
        job_id: impl Into<String>,
        pipeline_id: impl Into<String>,
        priority: Priority,
    ) -> Result<JobReference> {
        let job = JobReference::new(job_id, pipeline_id, priority);
        let payload = serde_json::to_string(&job)?;
        let depth = self.broker.rpush(self.lane_key(priority), payload).await?;

        debug!(
            job_id = %job.job_id,
            pipeline_id = %job.pipeline_id,
            priority = %priority,
            depth,
            "Enqueued job"
        );
        Ok(job)
    }

    /// Block up to `timeout` for the head of the highest-priority non-empty lane.
    ///
    /// Returns `Ok(None)` when every lane stays empty until the timeout, so
    /// callers can loop cheaply.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<JobReference>> {
        let Some((lane, payload)) = self.broker.blpop(&self.lanes, timeout).await? else {
            return Ok(None);
        };

        let job = json::parse_optional::<JobReference>(
            Some(&payload),
            JsonContext::QueueEntry { lane: &lane },
            "Discarding malformed queue entry",
        );
        if let Some(job) = &job {
            debug!(
                job_id = %job.job_id,
                pipeline_id = %job.pipeline_id,
                lane = %lane,
                "Dequeued job"
            );
        }
        Ok(job)
    }

    /// Remove a queued reference by job id. Returns whether one was removed.
    pub async fn remove_job(&self, job_id: &str) -> Result<bool> {
        self.remove_where(|job| job.job_id == job_id).await
    }

    /// Remove a queued reference by the pipeline it points at.
    pub async fn remove_pipeline(&self, pipeline_id: &str) -> Result<bool> {
        self.remove_where(|job| job.pipeline_id == pipeline_id).await
    }

    async fn remove_where<F>(&self, matches: F) -> Result<bool>
    where
        F: Fn(&JobReference) -> bool,
    {
        for lane in &self.lanes {
            for raw in self.broker.lrange(lane).await? {
                let Ok(job) = serde_json::from_str::<JobReference>(&raw) else {
                    continue;
                };
                if !matches(&job) {
                    continue;
                }
                // A worker may have popped it since the scan; keep looking in that case.
                if self.broker.lrem(lane, 1, &raw).await? > 0 {
                    debug!(job_id = %job.job_id, lane = %lane, "Removed queued job");
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Number of references waiting in one lane.
    pub async fn queue_length(&self, priority: Priority) -> Result<usize> {
        self.broker.llen(self.lane_key(priority)).await
    }

    /// Number of references waiting across all lanes.
    pub async fn total_queue_length(&self) -> Result<usize> {
        let mut total = 0;
        for lane in &self.lanes {
            total += self.broker.llen(lane).await?;
        }
        Ok(total)
    }

    /// Get the queue depth status.
    pub async fn depth_status(&self) -> Result<QueueDepthStatus> {
        let depth = self.total_queue_length().await?;
        let status = if depth >= self.config.critical_threshold {
            QueueDepthStatus::Critical
        } else if depth >= self.config.warning_threshold {
            QueueDepthStatus::Warning
        } else {
            QueueDepthStatus::Normal
        };
        if status != QueueDepthStatus::Normal {
            warn!(depth, ?status, "Queue depth above threshold");
        }
        Ok(status)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}
