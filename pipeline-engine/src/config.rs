//! Engine configuration.
//!
//! Values come from defaults, optionally overridden by environment variables
//! (a `.env` file is loaded first when present):
//!
//! | Variable | Field |
//! |---|---|
//! | `DATABASE_URL` | `database_url` |
//! | `PIPELINE_KEY_PREFIX` | `queue.key_prefix` |
//! | `PIPELINE_QUEUE_WARNING_THRESHOLD` | `queue.warning_threshold` |
//! | `PIPELINE_QUEUE_CRITICAL_THRESHOLD` | `queue.critical_threshold` |
//! | `PIPELINE_WORKERS` | `worker.max_workers` |
//! | `PIPELINE_DEQUEUE_TIMEOUT_MS` | `worker.dequeue_timeout_ms` |
//! | `PIPELINE_STAGE_TIMEOUT_SECS` | `worker.stage_timeout_secs` |
//! | `PIPELINE_CHANNEL_CAPACITY` | `broker.channel_capacity` |
//! | `PIPELINE_TTL_SECS` | `purge.ttl_secs` |
//! | `PIPELINE_PURGE_ENABLED` | `purge.enabled` |
//! | `PIPELINE_PURGE_INTERVAL_SECS` | `purge.check_interval_secs` |
//! | `PIPELINE_PURGE_BATCH_SIZE` | `purge.batch_size` |
//! | `PIPELINE_PURGE_WINDOW` | `purge.time_window` |
//! | `PIPELINE_LOG_DIR` | `log_dir` |

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

use crate::broker::DEFAULT_CHANNEL_CAPACITY;
use crate::pipeline::{PurgeConfig, WorkerPoolConfig};
use crate::queue::QueueConfig;
use crate::{Error, Result};

/// Default SQLite location.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:forge.db?mode=rwc";

/// Pub/sub provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Messages buffered per subscriber before it starts lagging.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Everything needed to run a [`crate::pipeline::PipelineManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerPoolConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub purge: PurgeConfig,
    /// Directory for rolling log files. Console only when unset.
    #[serde(default)]
    pub log_dir: Option<String>,
}

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            queue: QueueConfig::default(),
            worker: WorkerPoolConfig::default(),
            broker: BrokerConfig::default(),
            purge: PurgeConfig::default(),
            log_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue.key_prefix = prefix.into();
        self
    }

    pub fn with_workers(mut self, max_workers: usize) -> Self {
        self.worker.max_workers = max_workers;
        self
    }

    pub fn with_worker_config(mut self, worker: WorkerPoolConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_purge_config(mut self, purge: PurgeConfig) -> Self {
        self.purge = purge;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.broker.channel_capacity = capacity;
        self
    }

    /// Load `.env` (if any), then read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup, then validate it.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(prefix) = var("PIPELINE_KEY_PREFIX") {
            config.queue.key_prefix = prefix;
        }
        if let Some(dir) = var("PIPELINE_LOG_DIR") {
            config.log_dir = Some(dir);
        }
        if let Some(window) = var("PIPELINE_PURGE_WINDOW") {
            config.purge.time_window = Some(window);
        }

        parse_into(
            &var,
            "PIPELINE_QUEUE_WARNING_THRESHOLD",
            &mut config.queue.warning_threshold,
        )?;
        parse_into(
            &var,
            "PIPELINE_QUEUE_CRITICAL_THRESHOLD",
            &mut config.queue.critical_threshold,
        )?;
        parse_into(&var, "PIPELINE_WORKERS", &mut config.worker.max_workers)?;
        parse_into(
            &var,
            "PIPELINE_DEQUEUE_TIMEOUT_MS",
            &mut config.worker.dequeue_timeout_ms,
        )?;
        parse_into(
            &var,
            "PIPELINE_STAGE_TIMEOUT_SECS",
            &mut config.worker.stage_timeout_secs,
        )?;
        parse_into(
            &var,
            "PIPELINE_CHANNEL_CAPACITY",
            &mut config.broker.channel_capacity,
        )?;
        parse_into(&var, "PIPELINE_TTL_SECS", &mut config.purge.ttl_secs)?;
        parse_into(&var, "PIPELINE_PURGE_ENABLED", &mut config.purge.enabled)?;
        parse_into(
            &var,
            "PIPELINE_PURGE_INTERVAL_SECS",
            &mut config.purge.check_interval_secs,
        )?;
        parse_into(
            &var,
            "PIPELINE_PURGE_BATCH_SIZE",
            &mut config.purge.batch_size,
        )?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(Error::config("database_url must not be empty"));
        }
        if self.queue.key_prefix.trim().is_empty() {
            return Err(Error::config("queue key prefix must not be empty"));
        }
        if self.queue.warning_threshold > self.queue.critical_threshold {
            return Err(Error::config(format!(
                "queue warning threshold ({}) exceeds critical threshold ({})",
                self.queue.warning_threshold, self.queue.critical_threshold
            )));
        }
        if self.worker.max_workers == 0 {
            return Err(Error::config("at least one worker is required"));
        }
        if self.worker.dequeue_timeout_ms == 0 {
            return Err(Error::config("dequeue timeout must be positive"));
        }
        if self.broker.channel_capacity == 0 {
            return Err(Error::config("channel capacity must be positive"));
        }
        if self.purge.batch_size == 0 {
            return Err(Error::config("purge batch size must be positive"));
        }
        if self.purge.check_interval_secs == 0 {
            return Err(Error::config("purge interval must be positive"));
        }
        Ok(())
    }
}

fn parse_into<T, F>(var: &F, key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = var(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("{key}={raw:?} is invalid: {e}")))?;
    }
    Ok(())
}
