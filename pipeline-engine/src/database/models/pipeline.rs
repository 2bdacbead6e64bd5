//! Generation pipeline database models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{ms_to_datetime, now_ms};
use crate::Error;

/// Pipeline-level status.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PipelineStatus {
    /// Created and queued, not yet claimed by a worker.
    Initializing,
    /// Claimed by a worker; stages are running.
    Processing,
    /// Every stage completed or was skipped.
    Completed,
    /// A stage failed, or the job could not be run.
    Failed,
    /// Cancelled before or between stages.
    Cancelled,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Validate a pipeline-level transition.
    ///
    /// `initializing -> failed` covers jobs that could not be dispatched or claimed.
    pub fn can_transition_to(&self, target: PipelineStatus) -> bool {
        use PipelineStatus::*;

        matches!(
            (self, target),
            (Initializing, Processing | Cancelled | Failed)
                | (Processing, Completed | Failed | Cancelled)
        )
    }

    /// Attempt to transition to a new status.
    pub fn transition_to(&self, target: PipelineStatus) -> Result<PipelineStatus, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::transition(self, target))
        }
    }
}

/// Stage-level status.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Completed or skipped: later stages may start.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// No further transitions are possible.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn can_transition_to(&self, target: StageStatus) -> bool {
        use StageStatus::*;

        matches!(
            (self, target),
            (Pending, Processing | Skipped) | (Processing, Completed | Failed | Skipped)
        )
    }
}

/// Generation pipeline database model (`generation_pipelines`).
///
/// Timestamps are Unix epoch milliseconds (UTC).
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct PipelineDbModel {
    pub id: String,
    pub user_id: String,
    /// Set by asset linkage once a concrete artifact exists.
    pub asset_id: Option<String>,
    /// Opaque run parameters, only meaningful to the stage executor.
    pub config: String,
    pub status: PipelineStatus,
    /// 0-100.
    pub progress: i64,
    pub current_stage: Option<String>,
    pub error: Option<String>,
    pub error_stage: Option<String>,
    pub error_details: Option<String>,
    /// JSON object of stage results keyed by stage name.
    pub results: String,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
    pub expires_at: Option<i64>,
}

impl PipelineDbModel {
    pub fn new(user_id: impl Into<String>, config: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            asset_id: None,
            config: config.into(),
            status: PipelineStatus::Initializing,
            progress: 0,
            current_stage: None,
            error: None,
            error_stage: None,
            error_details: None,
            results: "{}".to_string(),
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            expires_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn expires_at_datetime(&self) -> Option<DateTime<Utc>> {
        self.expires_at.map(ms_to_datetime)
    }
}

/// Pipeline stage database model (`pipeline_stages`).
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct PipelineStageDbModel {
    pub id: String,
    pub pipeline_id: String,
    pub stage_name: String,
    pub stage_order: i64,
    pub status: StageStatus,
    pub progress: i64,
    pub result: Option<String>,
    pub error: Option<String>,
    pub error_details: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,
}

impl PipelineStageDbModel {
    pub fn new(pipeline_id: impl Into<String>, stage_name: impl Into<String>, order: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pipeline_id: pipeline_id.into(),
            stage_name: stage_name.into(),
            stage_order: order,
            status: StageStatus::Pending,
            progress: 0,
            result: None,
            error: None,
            error_details: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }
}

/// Request to create a pipeline and its ordered stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPipeline {
    pub user_id: String,
    pub config: String,
    /// Stage names in execution order.
    pub stages: Vec<String>,
}

impl NewPipeline {
    pub fn new<I, S>(user_id: impl Into<String>, config: impl Into<String>, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user_id: user_id.into(),
            config: config.into(),
            stages: stages.into_iter().map(Into::into).collect(),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.user_id.trim().is_empty() {
            return Err(Error::validation("user_id must not be empty"));
        }
        if self.stages.is_empty() {
            return Err(Error::validation("a pipeline needs at least one stage"));
        }
        let mut seen = std::collections::HashSet::new();
        for name in &self.stages {
            if name.trim().is_empty() {
                return Err(Error::validation("stage names must not be empty"));
            }
            if !seen.insert(name.as_str()) {
                return Err(Error::validation(format!("duplicate stage name '{name}'")));
            }
        }
        Ok(())
    }
}

/// A requested stage status change plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTransition {
    pub status: StageStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub error_details: Option<String>,
}

impl StageTransition {
    pub fn processing() -> Self {
        Self {
            status: StageStatus::Processing,
            result: None,
            error: None,
            error_details: None,
        }
    }

    pub fn completed(result: Option<String>) -> Self {
        Self {
            status: StageStatus::Completed,
            result,
            ..Self::processing()
        }
    }

    pub fn failed(error: impl Into<String>, details: Option<String>) -> Self {
        Self {
            status: StageStatus::Failed,
            result: None,
            error: Some(error.into()),
            error_details: details,
        }
    }

    pub fn skipped(reason: Option<String>) -> Self {
        Self {
            status: StageStatus::Skipped,
            result: reason,
            ..Self::processing()
        }
    }
}

/// Outcome of a claim attempt.
#[derive(Debug, Clone)]
pub struct Claim {
    pub pipeline: PipelineDbModel,
    /// False when the record was already past `initializing`.
    pub acquired: bool,
}

/// Authoritative read of a pipeline and its stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    pub pipeline: PipelineDbModel,
    pub stages: Vec<PipelineStageDbModel>,
}
