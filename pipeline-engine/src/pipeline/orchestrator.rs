//! Runs one dequeued job through its pipeline's stages.
//!
//! The orchestrator is the only writer of a pipeline while it is `processing`.
//! Stage failures are recorded as data; only persistence errors abort a job,
//! and even those never escape [`Orchestrator::process`].

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::executor::{StageExecutor, StageOutcome, StageRequest};
use super::progress::{ProgressBroadcaster, ProgressEvent};
use crate::database::models::{PipelineDbModel, PipelineStatus, StageStatus, StageTransition};
use crate::database::repositories::PipelineRepository;
use crate::queue::JobReference;
use crate::{Error, Result};

/// How a job left the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    Cancelled,
    /// The record was already past `initializing`; no stage ran. Only a
    /// terminal record gets a closing event.
    NotClaimed,
    /// A persistence error stopped the job.
    Aborted,
}

impl JobOutcome {
    fn from_status(status: PipelineStatus) -> Self {
        match status {
            PipelineStatus::Completed => Self::Completed,
            PipelineStatus::Failed => Self::Failed,
            PipelineStatus::Cancelled => Self::Cancelled,
            PipelineStatus::Initializing | PipelineStatus::Processing => Self::Aborted,
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn PipelineRepository>,
    broadcaster: Arc<ProgressBroadcaster>,
    executor: Arc<dyn StageExecutor>,
    stage_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn PipelineRepository>,
        broadcaster: Arc<ProgressBroadcaster>,
        executor: Arc<dyn StageExecutor>,
    ) -> Self {
        Self {
            store,
            broadcaster,
            executor,
            stage_timeout: None,
        }
    }

    /// Fail any stage whose executor runs longer than `timeout`.
    pub fn with_stage_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Process one job to a terminal state. Never returns an error.
    pub async fn process(&self, job: &JobReference) -> JobOutcome {
        let pipeline_id = job.pipeline_id.as_str();
        match self.run(pipeline_id).await {
            Ok(outcome) => {
                info!(
                    job_id = %job.job_id,
                    pipeline_id = %pipeline_id,
                    ?outcome,
                    "Job finished"
                );
                outcome
            }
            Err(e) => {
                error!(
                    job_id = %job.job_id,
                    pipeline_id = %pipeline_id,
                    error = %e,
                    connectivity = e.is_connectivity(),
                    "Persistence failure while running pipeline"
                );
                let message = format!("Persistence failure: {e}");
                if let Err(finalize_err) = self
                    .store
                    .finalize(pipeline_id, PipelineStatus::Failed, None, Some(&message))
                    .await
                {
                    warn!(
                        pipeline_id = %pipeline_id,
                        error = %finalize_err,
                        "Best-effort finalize after persistence failure also failed"
                    );
                }

                match self.store.get_pipeline(pipeline_id).await {
                    Ok(record) => self.publish_record(&record).await,
                    Err(_) => {
                        let event = ProgressEvent::new(pipeline_id, PipelineStatus::Failed, 0)
                            .with_error(message);
                        self.broadcaster.publish(pipeline_id, &event).await;
                    }
                }
                JobOutcome::Aborted
            }
        }
    }

    async fn run(&self, pipeline_id: &str) -> Result<JobOutcome> {
        let claim = self.store.claim_for_processing(pipeline_id).await?;
        if !claim.acquired {
            info!(
                pipeline_id = %pipeline_id,
                status = %claim.pipeline.status,
                "Pipeline not claimable; skipping stage execution"
            );
            // A live pipeline belongs to another worker, which owns its events.
            if claim.pipeline.is_terminal() {
                self.publish_record(&claim.pipeline).await;
            }
            return Ok(JobOutcome::NotClaimed);
        }
        self.publish_record(&claim.pipeline).await;

        let config = claim.pipeline.config.clone();
        let stages = self.store.list_stages(pipeline_id).await?;
        let mut failed = false;

        for stage in stages {
            if stage.status != StageStatus::Pending {
                continue;
            }

            // Cancellation is only observed between stages.
            let current = self.store.get_pipeline(pipeline_id).await?;
            if current.is_terminal() {
                info!(
                    pipeline_id = %pipeline_id,
                    status = %current.status,
                    next_stage = %stage.stage_name,
                    "Pipeline terminated externally; stopping before next stage"
                );
                return Ok(self.conclude(&current).await);
            }

            let Some(record) = self
                .advance(pipeline_id, &stage.stage_name, StageTransition::processing())
                .await?
            else {
                return self.conclude_current(pipeline_id).await;
            };
            self.publish_record(&record).await;

            let request = StageRequest {
                pipeline_id: pipeline_id.to_string(),
                stage_name: stage.stage_name.clone(),
                stage_order: stage.stage_order,
                config: config.clone(),
                prior_results: record.results.clone(),
            };
            let transition = self.execute_stage(request).await;
            failed = transition.status == StageStatus::Failed;

            let Some(record) = self
                .advance(pipeline_id, &stage.stage_name, transition)
                .await?
            else {
                return self.conclude_current(pipeline_id).await;
            };
            self.publish_record(&record).await;

            if failed {
                break;
            }
        }

        if !failed {
            self.store
                .finalize(pipeline_id, PipelineStatus::Completed, None, None)
                .await?;
        }
        self.conclude_current(pipeline_id).await
    }

    /// Apply a stage transition. `Ok(None)` means the pipeline went terminal
    /// underneath us (e.g. cancelled while the stage ran).
    async fn advance(
        &self,
        pipeline_id: &str,
        stage_name: &str,
        transition: StageTransition,
    ) -> Result<Option<PipelineDbModel>> {
        match self
            .store
            .advance_stage(pipeline_id, stage_name, &transition)
            .await
        {
            Ok(record) => Ok(Some(record)),
            Err(e @ Error::InvalidStateTransition { .. }) => {
                let current = self.store.get_pipeline(pipeline_id).await?;
                if current.is_terminal() {
                    info!(
                        pipeline_id = %pipeline_id,
                        stage = %stage_name,
                        status = %current.status,
                        "Pipeline became terminal while stage was running"
                    );
                    Ok(None)
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn execute_stage(&self, request: StageRequest) -> StageTransition {
        let pipeline_id = request.pipeline_id.clone();
        let stage_name = request.stage_name.clone();
        let executor = self.executor.clone();
        let started = Instant::now();

        let handle = tokio::spawn(async move { executor.execute(request).await });
        let abort = handle.abort_handle();

        let joined = match self.stage_timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    abort.abort();
                    warn!(
                        pipeline_id = %pipeline_id,
                        stage = %stage_name,
                        timeout = ?limit,
                        "Stage timed out"
                    );
                    return StageTransition::failed(
                        format!("Stage timed out after {}s", limit.as_secs()),
                        None,
                    );
                }
            },
            None => handle.await,
        };

        let transition = match joined {
            Ok(Ok(StageOutcome::Completed { result })) => StageTransition::completed(result),
            Ok(Ok(StageOutcome::Failed { error, details })) => {
                StageTransition::failed(error, details)
            }
            Ok(Ok(StageOutcome::Skipped { reason })) => StageTransition::skipped(reason),
            Ok(Err(e)) => {
                warn!(
                    pipeline_id = %pipeline_id,
                    stage = %stage_name,
                    error = %e,
                    "Stage executor returned an error"
                );
                StageTransition::failed(e.to_string(), None)
            }
            Err(join_err) if join_err.is_panic() => {
                let message = panic_message(join_err.into_panic().as_ref());
                error!(
                    pipeline_id = %pipeline_id,
                    stage = %stage_name,
                    panic = %message,
                    "Stage executor panicked"
                );
                StageTransition::failed("Stage executor panicked", Some(message))
            }
            Err(_) => StageTransition::failed("Stage executor task was cancelled", None),
        };

        debug!(
            pipeline_id = %pipeline_id,
            stage = %stage_name,
            status = %transition.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Stage executed"
        );
        transition
    }

    async fn conclude_current(&self, pipeline_id: &str) -> Result<JobOutcome> {
        let record = self.store.get_pipeline(pipeline_id).await?;
        Ok(self.conclude(&record).await)
    }

    /// Publish the final event for a job and map its status to an outcome.
    async fn conclude(&self, record: &PipelineDbModel) -> JobOutcome {
        if !record.is_terminal() {
            warn!(
                pipeline_id = %record.id,
                status = %record.status,
                "Job ended while pipeline is not terminal"
            );
        }
        self.publish_record(record).await;
        JobOutcome::from_status(record.status)
    }

    async fn publish_record(&self, record: &PipelineDbModel) {
        self.broadcaster
            .publish(&record.id, &ProgressEvent::from_record(record))
            .await;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "<non-string panic payload>".to_string()
}
