//! Background deletion of terminal pipelines whose retention has run out.
//!
//! Every terminal pipeline carries an `expires_at`; this service periodically
//! deletes the expired ones (stages included) in bounded batches.

use chrono::{NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::database::repositories::{DEFAULT_PIPELINE_TTL, PipelineRepository};
use crate::database::time::now_ms;

/// Configuration for pipeline purging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// Whether the background sweep runs at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Seconds a terminal pipeline is retained before it expires.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Time window for purging (e.g., "02:00-05:00").
    /// If None, purging can run at any time.
    #[serde(default)]
    pub time_window: Option<String>,

    /// Maximum pipelines deleted per transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Interval between purge checks in seconds.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_ttl_secs() -> u64 {
    DEFAULT_PIPELINE_TTL.as_secs()
}

fn default_batch_size() -> u32 {
    100
}

fn default_check_interval_secs() -> u64 {
    600
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            ttl_secs: default_ttl_secs(),
            time_window: None,
            batch_size: default_batch_size(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl PurgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_ttl_secs(mut self, secs: u64) -> Self {
        self.ttl_secs = secs;
        self
    }

    pub fn with_time_window(mut self, window: Option<String>) -> Self {
        self.time_window = window;
        self
    }

    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_check_interval_secs(mut self, secs: u64) -> Self {
        self.check_interval_secs = secs;
        self
    }

    /// Retention applied to pipelines when they reach a terminal state.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Parsed time window for purging.
#[derive(Debug, Clone)]
struct TimeWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl TimeWindow {
    /// Parse a window like "02:00-05:00".
    fn parse(window: &str) -> Option<Self> {
        let (start, end) = window.split_once('-')?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").ok()?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").ok()?;
        Some(Self { start, end })
    }

    fn is_within(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            // Overnight, e.g. 23:00-02:00
            time >= self.start || time < self.end
        }
    }
}

/// Deletes expired terminal pipelines.
pub struct PipelinePurgeService {
    config: PurgeConfig,
    repository: Arc<dyn PipelineRepository>,
    time_window: Option<TimeWindow>,
}

impl PipelinePurgeService {
    pub fn new(config: PurgeConfig, repository: Arc<dyn PipelineRepository>) -> Self {
        let time_window = config.time_window.as_deref().and_then(TimeWindow::parse);

        if config.time_window.is_some() && time_window.is_none() {
            warn!(
                "Invalid purge time window {:?}; expected HH:MM-HH:MM, purging at any time",
                config.time_window
            );
        }

        Self {
            config,
            repository,
            time_window,
        }
    }

    /// Whether the current UTC time falls inside the configured window.
    pub fn is_purge_allowed(&self) -> bool {
        self.time_window
            .as_ref()
            .is_none_or(|window| window.is_within(Utc::now().time()))
    }

    /// Delete every pipeline expired as of now, one batch at a time.
    /// Returns the number of pipelines deleted.
    pub async fn run_purge(&self) -> Result<u64> {
        if !self.config.enabled {
            debug!("Pipeline purging disabled");
            return Ok(0);
        }

        if !self.is_purge_allowed() {
            debug!("Purge not allowed outside time window");
            return Ok(0);
        }

        let batch_size = self.config.batch_size.max(1);
        let cutoff = now_ms();
        let mut total_deleted: u64 = 0;

        loop {
            let deleted = self.repository.purge_expired(cutoff, batch_size).await?;
            total_deleted += deleted;

            if deleted < u64::from(batch_size) {
                break;
            }

            // Small delay between batches to reduce database load
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if total_deleted > 0 {
            info!(deleted = total_deleted, "Purged expired pipelines");
        } else {
            debug!("No expired pipelines to purge");
        }

        Ok(total_deleted)
    }

    /// Run [`PipelinePurgeService::run_purge`] every `check_interval_secs` until cancelled.
    pub fn start_background_task(
        self: Arc<Self>,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(self.config.check_interval_secs.max(1));
            let mut check_interval = interval(period);
            check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                "Pipeline purge service started (ttl: {}s, interval: {}s)",
                self.config.ttl_secs,
                period.as_secs()
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Pipeline purge service shutting down");
                        break;
                    }
                    _ = check_interval.tick() => {
                        if let Err(e) = self.run_purge().await {
                            error!("Purge cycle failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    pub fn config(&self) -> &PurgeConfig {
        &self.config
    }
}
