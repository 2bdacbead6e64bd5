//! Seam to the content-generation collaborator that actually runs a stage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Everything a stage executor is given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRequest {
    pub pipeline_id: String,
    pub stage_name: String,
    pub stage_order: i64,
    /// Opaque run parameters from the pipeline record.
    pub config: String,
    /// JSON object of earlier stage results keyed by stage name.
    pub prior_results: String,
}

/// What a stage produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StageOutcome {
    Completed {
        #[serde(default)]
        result: Option<String>,
    },
    /// Halts the pipeline. Any retrying must already have happened.
    Failed {
        error: String,
        #[serde(default)]
        details: Option<String>,
    },
    /// Bypass this stage and continue with the next one.
    Skipped {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl StageOutcome {
    pub fn completed(result: impl Into<String>) -> Self {
        Self::Completed {
            result: Some(result.into()),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
            details: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: Some(reason.into()),
        }
    }
}

/// Runs one stage of a pipeline.
///
/// Implementations may take minutes and call third-party APIs. Returning `Err`
/// (or panicking) is recorded as a failed stage; it never stops the worker.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, request: StageRequest) -> Result<StageOutcome>;
}
