//! End-to-end tests driving the engine through `PipelineManager`.
//!
//! Each test uses an in-memory SQLite database (single connection) and an
//! in-process broker.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use pipeline_engine::broker::{Broker, MemoryBroker};
use pipeline_engine::config::EngineConfig;
use pipeline_engine::database::models::{
    Claim, NewPipeline, PipelineDbModel, PipelineStageDbModel, PipelineStatus, StageStatus,
    StageTransition,
};
use pipeline_engine::database::repositories::{PipelineRepository, SqlxPipelineRepository};
use pipeline_engine::database::{DbPool, init_pool_with_size, run_migrations};
use pipeline_engine::pipeline::{
    PipelineManager, PurgeConfig, StageExecutor, StageOutcome, StageRequest, WorkerPoolConfig,
};
use pipeline_engine::queue::Priority;
use pipeline_engine::{Error, Result};

/// Helper to create a test database pool with migrations applied.
async fn setup_test_db() -> DbPool {
    let pool = init_pool_with_size("sqlite::memory:", 1)
        .await
        .expect("Failed to create test pool");
    run_migrations(&pool).await.expect("Failed to run migrations");
    pool
}

fn test_config(workers: usize) -> EngineConfig {
    EngineConfig::new()
        .with_key_prefix("it")
        .with_worker_config(WorkerPoolConfig {
            max_workers: workers,
            dequeue_timeout_ms: 20,
            stage_timeout_secs: 0,
        })
        .with_purge_config(PurgeConfig::new().with_enabled(false))
}

/// Records every call; fails, skips or panics on stages named for it.
#[derive(Default)]
struct RecordingExecutor {
    calls: Mutex<Vec<(String, String)>>,
}

impl RecordingExecutor {
    fn pipelines_in_call_order(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for (pipeline_id, _) in self.calls.lock().iter() {
            if !seen.contains(pipeline_id) {
                seen.push(pipeline_id.clone());
            }
        }
        seen
    }

    fn calls_for(&self, pipeline_id: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|(p, _)| p == pipeline_id)
            .map(|(_, s)| s.clone())
            .collect()
    }
}

#[async_trait]
impl StageExecutor for RecordingExecutor {
    async fn execute(&self, request: StageRequest) -> Result<StageOutcome> {
        self.calls
            .lock()
            .push((request.pipeline_id.clone(), request.stage_name.clone()));
        match request.stage_name.as_str() {
            "render" => Ok(StageOutcome::Failed {
                error: "render backend rejected mesh".into(),
                details: Some("{\"code\":422}".into()),
            }),
            "optional" => Ok(StageOutcome::skipped("not requested")),
            "explode" => panic!("executor blew up"),
            other => Ok(StageOutcome::completed(format!("\"{other} ok\""))),
        }
    }
}

async fn wait_for_terminal(manager: &PipelineManager, pipeline_id: &str) -> PipelineDbModel {
    for _ in 0..500 {
        let record = manager.get_pipeline(pipeline_id).await.unwrap();
        if record.status.is_terminal() {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pipeline {pipeline_id} never reached a terminal state");
}

async fn manager_with(workers: usize) -> (PipelineManager, Arc<RecordingExecutor>) {
    let executor = Arc::new(RecordingExecutor::default());
    let manager = PipelineManager::new(
        test_config(workers),
        setup_test_db().await,
        Arc::new(MemoryBroker::new()),
        executor.clone(),
    );
    (manager, executor)
}

mod scheduling_tests {
    use super::*;

    #[tokio::test]
    async fn test_high_priority_submitted_later_runs_first() {
        let (manager, executor) = manager_with(1).await;

        let low = manager
            .submit(NewPipeline::new("u1", "{}", ["lore"]), Priority::Low)
            .await
            .unwrap();
        let high = manager
            .submit(NewPipeline::new("u1", "{}", ["lore"]), Priority::High)
            .await
            .unwrap();
        assert_eq!(manager.total_queue_length().await.unwrap(), 2);

        manager.start();
        wait_for_terminal(&manager, &low.id).await;
        wait_for_terminal(&manager, &high.id).await;

        assert_eq!(executor.pipelines_in_call_order(), vec![high.id, low.id]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let (manager, executor) = manager_with(1).await;

        let mut ids = Vec::new();
        for _ in 0..4 {
            let record = manager
                .submit(NewPipeline::new("u1", "{}", ["npc"]), Priority::Normal)
                .await
                .unwrap();
            ids.push(record.id);
        }

        manager.start();
        for id in &ids {
            wait_for_terminal(&manager, id).await;
        }
        assert_eq!(executor.pipelines_in_call_order(), ids);
        manager.shutdown().await;
    }
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_pipeline_runs_to_completion() {
        let (manager, executor) = manager_with(2).await;
        manager.start();

        let record = manager
            .submit(
                NewPipeline::new("u1", r#"{"kind":"quest"}"#, ["outline", "optional", "dialogue"]),
                Priority::Normal,
            )
            .await
            .unwrap();
        assert_eq!(record.status, PipelineStatus::Initializing);

        let done = wait_for_terminal(&manager, &record.id).await;
        assert_eq!(done.status, PipelineStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());
        assert!(done.expires_at.is_some());

        let results: serde_json::Value = serde_json::from_str(&done.results).unwrap();
        assert_eq!(results["outline"], "outline ok");
        assert_eq!(results["dialogue"], "dialogue ok");

        let stages = manager.list_stages(&record.id).await.unwrap();
        let statuses: Vec<_> = stages.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![StageStatus::Completed, StageStatus::Skipped, StageStatus::Completed]
        );
        assert_eq!(
            executor.calls_for(&record.id),
            vec!["outline", "optional", "dialogue"]
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_stage_leaves_later_stages_pending() {
        let (manager, executor) = manager_with(1).await;
        manager.start();

        let record = manager
            .submit(
                NewPipeline::new("u1", "{}", ["fetch", "render", "upload"]),
                Priority::Normal,
            )
            .await
            .unwrap();
        let done = wait_for_terminal(&manager, &record.id).await;

        assert_eq!(done.status, PipelineStatus::Failed);
        assert_eq!(done.error_stage.as_deref(), Some("render"));
        assert_eq!(done.error.as_deref(), Some("render backend rejected mesh"));
        assert_eq!(done.error_details.as_deref(), Some("{\"code\":422}"));

        let snapshot = manager.snapshot(&record.id).await.unwrap();
        assert_eq!(snapshot.stages[0].status, StageStatus::Completed);
        assert_eq!(snapshot.stages[1].status, StageStatus::Failed);
        assert_eq!(snapshot.stages[2].status, StageStatus::Pending);
        assert_eq!(executor.calls_for(&record.id), vec!["fetch", "render"]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_executor_panic_fails_pipeline_but_worker_survives() {
        let (manager, _executor) = manager_with(1).await;
        manager.start();

        let doomed = manager
            .submit(NewPipeline::new("u1", "{}", ["explode"]), Priority::Normal)
            .await
            .unwrap();
        let healthy = manager
            .submit(NewPipeline::new("u1", "{}", ["portrait"]), Priority::Normal)
            .await
            .unwrap();

        let doomed = wait_for_terminal(&manager, &doomed.id).await;
        assert_eq!(doomed.status, PipelineStatus::Failed);
        assert!(doomed.error_details.unwrap().contains("executor blew up"));

        let healthy = wait_for_terminal(&manager, &healthy.id).await;
        assert_eq!(healthy.status, PipelineStatus::Completed);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_terminal_pipeline_is_immutable() {
        let (manager, _executor) = manager_with(1).await;
        manager.start();
        let record = manager
            .submit(NewPipeline::new("u1", "{}", ["npc"]), Priority::High)
            .await
            .unwrap();
        let done = wait_for_terminal(&manager, &record.id).await;

        assert!(!manager.cancel(&record.id).await.unwrap());
        let after = manager.get_pipeline(&record.id).await.unwrap();
        assert_eq!(after.status, PipelineStatus::Completed);
        assert_eq!(after.completed_at, done.completed_at);
        assert_eq!(after.progress, 100);

        manager.link_asset(&record.id, "asset-42").await.unwrap();
        let linked = manager.get_pipeline(&record.id).await.unwrap();
        assert_eq!(linked.asset_id.as_deref(), Some("asset-42"));
        assert_eq!(linked.status, PipelineStatus::Completed);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected_before_queueing() {
        let (manager, _executor) = manager_with(1).await;
        let err = manager
            .submit(NewPipeline::new("u1", "{}", Vec::<String>::new()), Priority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(manager.total_queue_length().await.unwrap(), 0);
    }
}

mod cancellation_tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_before_claim_removes_job() {
        let (manager, executor) = manager_with(1).await;

        let record = manager
            .submit(NewPipeline::new("u1", "{}", ["npc"]), Priority::High)
            .await
            .unwrap();
        assert!(manager.cancel(&record.id).await.unwrap());
        assert!(!manager.cancel(&record.id).await.unwrap());
        assert_eq!(manager.queue_length(Priority::High).await.unwrap(), 0);

        let marker = manager
            .submit(NewPipeline::new("u1", "{}", ["npc"]), Priority::Low)
            .await
            .unwrap();
        manager.start();
        wait_for_terminal(&manager, &marker.id).await;

        let cancelled = manager.get_pipeline(&record.id).await.unwrap();
        assert_eq!(cancelled.status, PipelineStatus::Cancelled);
        assert!(cancelled.started_at.is_none());
        assert!(cancelled.expires_at.is_some());
        assert!(executor.calls_for(&record.id).is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_unknown_pipeline_is_not_found() {
        let (manager, _executor) = manager_with(1).await;
        let err = manager.cancel("does-not-exist").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}

mod progress_tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_observe_every_transition_in_order() {
        let (manager, _executor) = manager_with(1).await;

        let record = manager
            .submit(NewPipeline::new("u1", "{}", ["outline", "dialogue"]), Priority::Normal)
            .await
            .unwrap();
        let mut pipeline_sub = manager.subscribe(&record.id).await.unwrap();
        let mut global_sub = manager.subscribe_all().await.unwrap();

        manager.start();

        // claim, 2 x (stage processing, stage resolved), final
        let mut seen = Vec::new();
        for _ in 0..6 {
            let event = tokio::time::timeout(Duration::from_secs(5), pipeline_sub.recv())
                .await
                .unwrap()
                .unwrap();
            let global = tokio::time::timeout(Duration::from_secs(5), global_sub.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event, global);
            seen.push(event);
        }

        assert!(seen.iter().all(|e| e.pipeline_id == record.id));
        assert_eq!(seen[0].status, PipelineStatus::Processing);
        assert_eq!(seen[1].stage.as_deref(), Some("outline"));
        assert_eq!(seen[3].stage.as_deref(), Some("dialogue"));
        assert_eq!(seen[5].status, PipelineStatus::Completed);
        assert_eq!(seen[5].progress, 100);
        assert!(seen.windows(2).all(|w| w[0].progress <= w[1].progress));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_snapshot_then_stream_reconciles() {
        let (manager, _executor) = manager_with(1).await;
        let record = manager
            .submit(NewPipeline::new("u1", "{}", ["npc"]), Priority::Normal)
            .await
            .unwrap();

        let snapshot = manager.snapshot(&record.id).await.unwrap();
        assert_eq!(snapshot.pipeline.status, PipelineStatus::Initializing);
        assert_eq!(snapshot.stages.len(), 1);

        let stream = manager.subscribe(&record.id).await.unwrap();
        manager.start();
        wait_for_terminal(&manager, &record.id).await;
        manager.shutdown().await;

        // The stream ends once the broker closes.
        use futures::StreamExt;
        let events: Vec<_> = stream.into_stream().collect().await;
        assert_eq!(events.last().unwrap().status, PipelineStatus::Completed);
    }
}

mod failure_tests {
    use super::*;

    /// Delegates to SQLite but fails the result write of stages named `poison`.
    struct FlakyStore {
        inner: SqlxPipelineRepository,
    }

    #[async_trait]
    impl PipelineRepository for FlakyStore {
        async fn create_pipeline(&self, new: &NewPipeline) -> Result<PipelineDbModel> {
            self.inner.create_pipeline(new).await
        }

        async fn get_pipeline(&self, id: &str) -> Result<PipelineDbModel> {
            self.inner.get_pipeline(id).await
        }

        async fn list_stages(&self, pipeline_id: &str) -> Result<Vec<PipelineStageDbModel>> {
            self.inner.list_stages(pipeline_id).await
        }

        async fn list_pipelines_for_user(
            &self,
            user_id: &str,
            limit: u32,
        ) -> Result<Vec<PipelineDbModel>> {
            self.inner.list_pipelines_for_user(user_id, limit).await
        }

        async fn claim_for_processing(&self, id: &str) -> Result<Claim> {
            self.inner.claim_for_processing(id).await
        }

        async fn advance_stage(
            &self,
            pipeline_id: &str,
            stage_name: &str,
            transition: &StageTransition,
        ) -> Result<PipelineDbModel> {
            if stage_name == "poison" && transition.status != StageStatus::Processing {
                return Err(Error::DatabaseSqlx(sqlx::Error::PoolTimedOut));
            }
            self.inner
                .advance_stage(pipeline_id, stage_name, transition)
                .await
        }

        async fn finalize(
            &self,
            pipeline_id: &str,
            status: PipelineStatus,
            result: Option<&str>,
            error: Option<&str>,
        ) -> Result<bool> {
            self.inner.finalize(pipeline_id, status, result, error).await
        }

        async fn cancel(&self, pipeline_id: &str) -> Result<bool> {
            self.inner.cancel(pipeline_id).await
        }

        async fn link_asset(&self, pipeline_id: &str, asset_id: &str) -> Result<()> {
            self.inner.link_asset(pipeline_id, asset_id).await
        }

        async fn purge_expired(&self, now_ms: i64, batch_size: u32) -> Result<u64> {
            self.inner.purge_expired(now_ms, batch_size).await
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_is_scoped_to_one_job() {
        let store = Arc::new(FlakyStore {
            inner: SqlxPipelineRepository::new(setup_test_db().await),
        });
        let manager = PipelineManager::with_repository(
            test_config(1),
            store,
            Arc::new(MemoryBroker::new()),
            Arc::new(RecordingExecutor::default()),
        );
        manager.start();

        let broken = manager
            .submit(NewPipeline::new("u1", "{}", ["lore", "poison"]), Priority::High)
            .await
            .unwrap();
        let fine = manager
            .submit(NewPipeline::new("u1", "{}", ["lore"]), Priority::Low)
            .await
            .unwrap();

        let broken_id = broken.id;
        let broken = wait_for_terminal(&manager, &broken_id).await;
        assert_eq!(broken.status, PipelineStatus::Failed);
        assert!(broken.error.unwrap().starts_with("Persistence failure"));

        // The stage whose result could not be written is closed out as failed.
        let stages = manager.list_stages(&broken_id).await.unwrap();
        assert_eq!(stages[0].status, StageStatus::Completed);
        assert_eq!(stages[1].status, StageStatus::Failed);
        assert!(stages[1].completed_at.is_some());

        let fine = wait_for_terminal(&manager, &fine.id).await;
        assert_eq!(fine.status, PipelineStatus::Completed);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_broker_closed_marks_pipeline_failed() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let manager = PipelineManager::new(
            test_config(1),
            setup_test_db().await,
            broker.clone(),
            Arc::new(RecordingExecutor::default()),
        );
        broker.close();

        let err = manager
            .submit(NewPipeline::new("u1", "{}", ["npc"]), Priority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BrokerUnavailable(_)));

        let records = manager.list_pipelines_for_user("u1", 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, PipelineStatus::Failed);
        assert!(records[0].error.as_deref().unwrap().contains("Failed to enqueue"));
        assert!(records[0].expires_at.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers_and_ends_subscriptions() {
        let (manager, _executor) = manager_with(3).await;
        manager.start();
        assert!(manager.is_running());

        let mut sub = manager.subscribe_all().await.unwrap();
        manager.shutdown().await;

        assert!(!manager.is_running());
        assert_eq!(manager.active_workers(), 0);
        assert!(sub.recv().await.is_none());
        assert!(matches!(
            manager.total_queue_length().await,
            Err(Error::BrokerUnavailable(_))
        ));
    }
}

mod purge_tests {
    use super::*;

    #[tokio::test]
    async fn test_expired_pipelines_are_purged() {
        let executor = Arc::new(RecordingExecutor::default());
        let config = test_config(1).with_purge_config(PurgeConfig::new().with_ttl_secs(0));
        let manager = PipelineManager::new(
            config,
            setup_test_db().await,
            Arc::new(MemoryBroker::new()),
            executor,
        );
        manager.start();

        let record = manager
            .submit(NewPipeline::new("u1", "{}", ["npc"]), Priority::Normal)
            .await
            .unwrap();
        wait_for_terminal(&manager, &record.id).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        // The background sweep may have beaten us to it.
        assert!(manager.purge_expired().await.unwrap() <= 1);
        assert!(matches!(
            manager.get_pipeline(&record.id).await,
            Err(Error::NotFound { .. })
        ));
        manager.shutdown().await;
    }
}
