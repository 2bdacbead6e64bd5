//! Pipeline repository: durable record store and state machine.
//!
//! Every pipeline and stage mutation goes through this trait. Guarded updates
//! (`WHERE status = ...`) make claims and cancellations race-free without any
//! locking beyond SQLite's own write lock.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{SqliteConnection, SqlitePool};
use std::time::Duration;
use tracing::{debug, info};

use crate::database::begin_immediate;
use crate::database::models::{
    Claim, NewPipeline, PipelineDbModel, PipelineSnapshot, PipelineStageDbModel, PipelineStatus,
    StageStatus, StageTransition,
};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::{expiry_after, now_ms};
use crate::utils::json::{self, JsonContext};
use crate::{Error, Result};

/// Default time a terminal pipeline is kept before it becomes eligible for purging.
pub const DEFAULT_PIPELINE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Pipeline repository trait.
#[async_trait]
pub trait PipelineRepository: Send + Sync {
    /// Create a pipeline (`initializing`, progress 0) with all its stages `pending`.
    async fn create_pipeline(&self, new: &NewPipeline) -> Result<PipelineDbModel>;

    async fn get_pipeline(&self, id: &str) -> Result<PipelineDbModel>;

    /// Stages in ascending `stage_order`.
    async fn list_stages(&self, pipeline_id: &str) -> Result<Vec<PipelineStageDbModel>>;

    async fn list_pipelines_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<PipelineDbModel>>;

    /// Move `initializing -> processing`. Any other current status is a no-op
    /// reported as `acquired = false`.
    async fn claim_for_processing(&self, id: &str) -> Result<Claim>;

    /// Apply a stage transition and recompute the pipeline's progress.
    ///
    /// A `failed` stage cascades the pipeline to `failed`. Returns the updated
    /// pipeline record.
    async fn advance_stage(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        transition: &StageTransition,
    ) -> Result<PipelineDbModel>;

    /// Move the pipeline into a terminal status. Returns `false` if it already was terminal.
    async fn finalize(
        &self,
        pipeline_id: &str,
        status: PipelineStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool>;

    /// Cancel an `initializing` or `processing` pipeline. Returns `false` if already terminal.
    async fn cancel(&self, pipeline_id: &str) -> Result<bool>;

    /// Record the artifact produced by a pipeline.
    async fn link_asset(&self, pipeline_id: &str, asset_id: &str) -> Result<()>;

    /// Delete up to `batch_size` terminal pipelines whose `expires_at <= now_ms`.
    async fn purge_expired(&self, now_ms: i64, batch_size: u32) -> Result<u64>;

    /// Pipeline plus stages; the baseline a live subscriber reconciles against.
    async fn snapshot(&self, pipeline_id: &str) -> Result<PipelineSnapshot> {
        let pipeline = self.get_pipeline(pipeline_id).await?;
        let stages = self.list_stages(pipeline_id).await?;
        Ok(PipelineSnapshot { pipeline, stages })
    }
}

/// SQLx implementation of PipelineRepository.
pub struct SqlxPipelineRepository {
    pool: SqlitePool,
    ttl: Duration,
}

impl SqlxPipelineRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            ttl: DEFAULT_PIPELINE_TTL,
        }
    }

    /// Set how long terminal pipelines are retained.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

fn merge_stage_result(pipeline: &PipelineDbModel, stage_name: &str, raw: &str) -> Result<String> {
    let mut results: Map<String, Value> = json::parse_or_default(
        &pipeline.results,
        JsonContext::PipelineField {
            pipeline_id: &pipeline.id,
            field: "results",
        },
        "Pipeline results were not a JSON object; starting a new one",
    );
    results.insert(stage_name.to_string(), json::value_or_string(raw));
    Ok(serde_json::to_string(&results)?)
}

fn stage_progress(stages: &[PipelineStageDbModel], changed_id: &str, status: StageStatus) -> i64 {
    let resolved = stages
        .iter()
        .filter(|s| {
            if s.id == changed_id {
                status.is_resolved()
            } else {
                s.status.is_resolved()
            }
        })
        .count();
    ((resolved * 100) / stages.len().max(1)) as i64
}

/// Stage status a still-running stage settles into when its pipeline ends as `status`.
fn settled_stage_status(status: PipelineStatus) -> StageStatus {
    match status {
        PipelineStatus::Completed => StageStatus::Completed,
        PipelineStatus::Failed => StageStatus::Failed,
        PipelineStatus::Initializing | PipelineStatus::Processing | PipelineStatus::Cancelled => {
            StageStatus::Skipped
        }
    }
}

/// Close out the `processing` stage of a pipeline that just went terminal.
///
/// A terminal pipeline never keeps a running stage; its timing fields are
/// filled in as if the stage had ended now.
async fn settle_running_stages(
    conn: &mut SqliteConnection,
    pipeline_id: &str,
    status: StageStatus,
    error: Option<&str>,
    now: i64,
) -> Result<u64> {
    debug_assert!(StageStatus::Processing.can_transition_to(status));
    let result = sqlx::query(
        r#"
        UPDATE pipeline_stages
        SET status = ?,
            progress = CASE WHEN ? = 'completed' THEN 100 ELSE progress END,
            error = COALESCE(?, error),
            completed_at = ?,
            duration_ms = CASE WHEN started_at IS NULL THEN NULL ELSE MAX(? - started_at, 0) END
        WHERE pipeline_id = ? AND status = 'processing'
        "#,
    )
    .bind(status.as_str())
    .bind(status.as_str())
    .bind(error)
    .bind(now)
    .bind(now)
    .bind(pipeline_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() > 0 {
        debug!(
            pipeline_id = %pipeline_id,
            status = %status,
            stages = result.rows_affected(),
            "Settled running stage of terminal pipeline"
        );
    }
    Ok(result.rows_affected())
}

async fn fetch_pipeline(conn: &mut SqliteConnection, id: &str) -> Result<PipelineDbModel> {
    sqlx::query_as::<_, PipelineDbModel>("SELECT * FROM generation_pipelines WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found("Pipeline", id))
}

async fn insert_pipeline(
    conn: &mut SqliteConnection,
    pipeline: &PipelineDbModel,
    stages: &[PipelineStageDbModel],
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO generation_pipelines (
            id, user_id, asset_id, config, status, progress, current_stage,
            error, error_stage, error_details, results,
            created_at, started_at, completed_at, updated_at, expires_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&pipeline.id)
    .bind(&pipeline.user_id)
    .bind(&pipeline.asset_id)
    .bind(&pipeline.config)
    .bind(pipeline.status.as_str())
    .bind(pipeline.progress)
    .bind(&pipeline.current_stage)
    .bind(&pipeline.error)
    .bind(&pipeline.error_stage)
    .bind(&pipeline.error_details)
    .bind(&pipeline.results)
    .bind(pipeline.created_at)
    .bind(pipeline.started_at)
    .bind(pipeline.completed_at)
    .bind(pipeline.updated_at)
    .bind(pipeline.expires_at)
    .execute(&mut *conn)
    .await?;

    for stage in stages {
        sqlx::query(
            r#"
            INSERT INTO pipeline_stages (id, pipeline_id, stage_name, stage_order, status, progress)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&stage.id)
        .bind(&stage.pipeline_id)
        .bind(&stage.stage_name)
        .bind(stage.stage_order)
        .bind(stage.status.as_str())
        .bind(stage.progress)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn delete_expired(conn: &mut SqliteConnection, now_ms: i64, batch_size: u32) -> Result<u64> {
    let ids: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT id FROM generation_pipelines
        WHERE expires_at IS NOT NULL AND expires_at <= ?
          AND status IN ('completed', 'failed', 'cancelled')
        ORDER BY expires_at, id
        LIMIT ?
        "#,
    )
    .bind(now_ms)
    .bind(i64::from(batch_size))
    .fetch_all(&mut *conn)
    .await?;

    if ids.is_empty() {
        return Ok(0);
    }
    let ids_json = serde_json::to_string(&ids)?;

    // Stage rows also cascade, but do not rely on the foreign_keys pragma.
    sqlx::query("DELETE FROM pipeline_stages WHERE pipeline_id IN (SELECT value FROM json_each(?))")
        .bind(&ids_json)
        .execute(&mut *conn)
        .await?;

    let deleted = sqlx::query(
        "DELETE FROM generation_pipelines WHERE id IN (SELECT value FROM json_each(?))",
    )
    .bind(&ids_json)
    .execute(&mut *conn)
    .await?;
    Ok(deleted.rows_affected())
}

impl SqlxPipelineRepository {
    async fn apply_stage_transition(
        &self,
        conn: &mut SqliteConnection,
        pipeline_id: &str,
        stage_name: &str,
        transition: &StageTransition,
    ) -> Result<PipelineDbModel> {
        let now = now_ms();
        let pipeline = fetch_pipeline(conn, pipeline_id).await?;

        if pipeline.status != PipelineStatus::Processing {
            return Err(Error::transition(
                format!("pipeline {}", pipeline.status),
                format!("stage '{}' {}", stage_name, transition.status),
            ));
        }

        let stages = sqlx::query_as::<_, PipelineStageDbModel>(
            "SELECT * FROM pipeline_stages WHERE pipeline_id = ? ORDER BY stage_order",
        )
        .bind(pipeline_id)
        .fetch_all(&mut *conn)
        .await?;

        let stage = stages
            .iter()
            .find(|s| s.stage_name == stage_name)
            .ok_or_else(|| {
                Error::not_found("PipelineStage", format!("{pipeline_id}/{stage_name}"))
            })?;

        let status = transition.status;
        if !stage.status.can_transition_to(status) {
            return Err(Error::transition(
                format!("stage '{}' {}", stage_name, stage.status),
                status,
            ));
        }

        if stage.status == StageStatus::Pending
            && let Some(blocker) = stages
                .iter()
                .find(|s| s.stage_order < stage.stage_order && !s.status.is_resolved())
        {
            return Err(Error::transition(
                format!(
                    "stage '{}' pending while '{}' is {}",
                    stage_name, blocker.stage_name, blocker.status
                ),
                status,
            ));
        }

        let started_at = if status == StageStatus::Processing {
            Some(now)
        } else {
            stage.started_at
        };
        let finished = status.is_finished();
        let completed_at = finished.then_some(now);
        let duration_ms = if finished {
            started_at.map(|started| (now - started).max(0))
        } else {
            None
        };
        let progress = if status == StageStatus::Completed {
            100
        } else {
            stage.progress
        };

        sqlx::query(
            r#"
            UPDATE pipeline_stages
            SET status = ?, progress = ?, result = COALESCE(?, result), error = ?,
                error_details = ?, started_at = ?, completed_at = ?, duration_ms = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(progress)
        .bind(&transition.result)
        .bind(&transition.error)
        .bind(&transition.error_details)
        .bind(started_at)
        .bind(completed_at)
        .bind(duration_ms)
        .bind(&stage.id)
        .execute(&mut *conn)
        .await?;

        let pipeline_progress = pipeline
            .progress
            .max(stage_progress(&stages, &stage.id, status));
        let results = match (&transition.result, status) {
            (Some(raw), StageStatus::Completed) => merge_stage_result(&pipeline, stage_name, raw)?,
            _ => pipeline.results.clone(),
        };

        if status == StageStatus::Failed {
            let error = transition
                .error
                .clone()
                .unwrap_or_else(|| format!("Stage '{stage_name}' failed"));
            sqlx::query(
                r#"
                UPDATE generation_pipelines
                SET status = 'failed', progress = ?, current_stage = ?, results = ?,
                    error = ?, error_stage = ?, error_details = ?,
                    completed_at = ?, expires_at = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(pipeline_progress)
            .bind(stage_name)
            .bind(&results)
            .bind(&error)
            .bind(stage_name)
            .bind(&transition.error_details)
            .bind(now)
            .bind(expiry_after(now, self.ttl))
            .bind(now)
            .bind(pipeline_id)
            .execute(&mut *conn)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE generation_pipelines
                SET progress = ?, current_stage = ?, results = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(pipeline_progress)
            .bind(stage_name)
            .bind(&results)
            .bind(now)
            .bind(pipeline_id)
            .execute(&mut *conn)
            .await?;
        }

        let updated = fetch_pipeline(conn, pipeline_id).await?;
        debug!(
            pipeline_id = %pipeline_id,
            stage = %stage_name,
            status = %status,
            progress = updated.progress,
            "Advanced stage"
        );
        Ok(updated)
    }

    async fn apply_finalize(
        &self,
        conn: &mut SqliteConnection,
        pipeline_id: &str,
        status: PipelineStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool> {
        let now = now_ms();
        let pipeline = fetch_pipeline(conn, pipeline_id).await?;

        if pipeline.is_terminal() {
            debug!(
                pipeline_id = %pipeline_id,
                status = %pipeline.status,
                "Pipeline already terminal; finalize is a no-op"
            );
            return Ok(false);
        }
        pipeline.status.transition_to(status)?;

        let progress = if status == PipelineStatus::Completed {
            100
        } else {
            pipeline.progress
        };
        let (error, error_stage) = if status == PipelineStatus::Failed {
            (
                Some(error.unwrap_or("Pipeline failed").to_string()),
                pipeline.current_stage.clone(),
            )
        } else {
            (None, None)
        };
        let results = result.map_or_else(|| pipeline.results.clone(), str::to_string);

        sqlx::query(
            r#"
            UPDATE generation_pipelines
            SET status = ?, progress = ?, results = ?, error = ?, error_stage = ?,
                error_details = NULL, completed_at = ?, expires_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(progress)
        .bind(&results)
        .bind(&error)
        .bind(&error_stage)
        .bind(now)
        .bind(expiry_after(now, self.ttl))
        .bind(now)
        .bind(pipeline_id)
        .execute(&mut *conn)
        .await?;

        settle_running_stages(
            conn,
            pipeline_id,
            settled_stage_status(status),
            error.as_deref(),
            now,
        )
        .await?;

        info!(pipeline_id = %pipeline_id, status = %status, "Pipeline finalized");
        Ok(true)
    }

    async fn apply_cancel(&self, conn: &mut SqliteConnection, pipeline_id: &str) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE generation_pipelines
            SET status = 'cancelled', completed_at = ?, expires_at = ?, updated_at = ?
            WHERE id = ? AND status IN ('initializing', 'processing')
            "#,
        )
        .bind(now)
        .bind(expiry_after(now, self.ttl))
        .bind(now)
        .bind(pipeline_id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }
        settle_running_stages(conn, pipeline_id, StageStatus::Skipped, None, now).await?;
        Ok(true)
    }
}

#[async_trait]
impl PipelineRepository for SqlxPipelineRepository {
    async fn create_pipeline(&self, new: &NewPipeline) -> Result<PipelineDbModel> {
        new.validate()?;

        let pipeline = PipelineDbModel::new(&new.user_id, &new.config);
        let stages: Vec<PipelineStageDbModel> = new
            .stages
            .iter()
            .enumerate()
            .map(|(i, name)| PipelineStageDbModel::new(&pipeline.id, name, i as i64 + 1))
            .collect();

        retry_on_sqlite_busy("create_pipeline", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let result = insert_pipeline(&mut tx, &pipeline, &stages).await;
            tx.finish(result).await
        })
        .await?;

        debug!(
            pipeline_id = %pipeline.id,
            user_id = %pipeline.user_id,
            stages = stages.len(),
            "Created pipeline"
        );
        Ok(pipeline)
    }

    async fn get_pipeline(&self, id: &str) -> Result<PipelineDbModel> {
        sqlx::query_as::<_, PipelineDbModel>("SELECT * FROM generation_pipelines WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Pipeline", id))
    }

    async fn list_stages(&self, pipeline_id: &str) -> Result<Vec<PipelineStageDbModel>> {
        let stages = sqlx::query_as::<_, PipelineStageDbModel>(
            "SELECT * FROM pipeline_stages WHERE pipeline_id = ? ORDER BY stage_order",
        )
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(stages)
    }

    async fn list_pipelines_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<PipelineDbModel>> {
        let pipelines = sqlx::query_as::<_, PipelineDbModel>(
            r#"
            SELECT * FROM generation_pipelines
            WHERE user_id = ?
            ORDER BY created_at DESC, id
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(pipelines)
    }

    async fn claim_for_processing(&self, id: &str) -> Result<Claim> {
        let claimed = retry_on_sqlite_busy("claim_for_processing", || async {
            let now = now_ms();
            let result = sqlx::query(
                r#"
                UPDATE generation_pipelines
                SET status = 'processing', started_at = ?, updated_at = ?
                WHERE id = ? AND status = 'initializing'
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await?;

        let pipeline = self.get_pipeline(id).await?;
        if !claimed {
            debug!(
                pipeline_id = %id,
                status = %pipeline.status,
                "Pipeline already past initializing; claim is a no-op"
            );
        }
        Ok(Claim {
            pipeline,
            acquired: claimed,
        })
    }

    async fn advance_stage(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        transition: &StageTransition,
    ) -> Result<PipelineDbModel> {
        retry_on_sqlite_busy("advance_stage", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let result = self
                .apply_stage_transition(&mut tx, pipeline_id, stage_name, transition)
                .await;
            tx.finish(result).await
        })
        .await
    }

    async fn finalize(
        &self,
        pipeline_id: &str,
        status: PipelineStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(Error::validation(format!(
                "cannot finalize a pipeline as '{status}'"
            )));
        }

        retry_on_sqlite_busy("finalize", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let finalized = self
                .apply_finalize(&mut tx, pipeline_id, status, result, error)
                .await;
            tx.finish(finalized).await
        })
        .await
    }

    async fn cancel(&self, pipeline_id: &str) -> Result<bool> {
        let cancelled = retry_on_sqlite_busy("cancel_pipeline", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let result = self.apply_cancel(&mut tx, pipeline_id).await;
            tx.finish(result).await
        })
        .await?;

        if cancelled {
            info!(pipeline_id = %pipeline_id, "Pipeline cancelled");
        } else {
            // Distinguish "already terminal" from "does not exist".
            self.get_pipeline(pipeline_id).await?;
        }
        Ok(cancelled)
    }

    async fn link_asset(&self, pipeline_id: &str, asset_id: &str) -> Result<()> {
        let result = retry_on_sqlite_busy("link_asset", || async {
            let result = sqlx::query(
                "UPDATE generation_pipelines SET asset_id = ?, updated_at = ? WHERE id = ?",
            )
            .bind(asset_id)
            .bind(now_ms())
            .bind(pipeline_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if result == 0 {
            return Err(Error::not_found("Pipeline", pipeline_id));
        }
        Ok(())
    }

    async fn purge_expired(&self, now_ms: i64, batch_size: u32) -> Result<u64> {
        retry_on_sqlite_busy("purge_expired", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let result = delete_expired(&mut tx, now_ms, batch_size).await;
            tx.finish(result).await
        })
        .await
    }
}
