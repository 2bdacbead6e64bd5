//! Concurrency stress against a file-backed SQLite database.
//!
//! Many workers and many connections contend for the same records; every
//! pipeline must be claimed once and every stage executed once.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinSet;

use pipeline_engine::Result;
use pipeline_engine::broker::MemoryBroker;
use pipeline_engine::config::EngineConfig;
use pipeline_engine::database::models::{NewPipeline, PipelineStatus};
use pipeline_engine::database::repositories::{PipelineRepository, SqlxPipelineRepository};
use pipeline_engine::database::{DbPool, init_pool_with_size, run_migrations};
use pipeline_engine::pipeline::{
    PipelineManager, PurgeConfig, StageExecutor, StageOutcome, StageRequest, WorkerPoolConfig,
};
use pipeline_engine::queue::Priority;

async fn file_pool(dir: &TempDir, max_connections: u32) -> DbPool {
    let path = dir.path().join("stress.db");
    let url = format!("sqlite:{}?mode=rwc", path.display());
    let pool = init_pool_with_size(&url, max_connections).await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

/// Counts executions per (pipeline, stage) and yields between calls.
#[derive(Default)]
struct CountingExecutor {
    executions: DashMap<(String, String), u32>,
}

#[async_trait]
impl StageExecutor for CountingExecutor {
    async fn execute(&self, request: StageRequest) -> Result<StageOutcome> {
        *self
            .executions
            .entry((request.pipeline_id.clone(), request.stage_name.clone()))
            .or_insert(0) += 1;
        tokio::time::sleep(Duration::from_millis(rand::random::<u64>() % 3)).await;
        Ok(StageOutcome::completed(request.stage_order.to_string()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_exactly_one_winner() {
    let dir = TempDir::new().unwrap();
    let repo = Arc::new(SqlxPipelineRepository::new(file_pool(&dir, 16).await));

    for _ in 0..10 {
        let record = repo
            .create_pipeline(&NewPipeline::new("stress", "{}", ["a"]))
            .await
            .unwrap();

        let winners = Arc::new(DashSet::new());
        let mut tasks = JoinSet::new();
        for contender in 0..16u32 {
            let repo = repo.clone();
            let winners = winners.clone();
            let id = record.id.clone();
            tasks.spawn(async move {
                let claim = repo.claim_for_processing(&id).await.unwrap();
                assert_eq!(claim.pipeline.status, PipelineStatus::Processing);
                if claim.acquired {
                    winners.insert(contender);
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        assert_eq!(winners.len(), 1, "pipeline {} claimed more than once", record.id);
        let stored = repo.get_pipeline(&record.id).await.unwrap();
        assert!(stored.started_at.is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_workers_process_each_pipeline_once() {
    const PIPELINES: usize = 40;
    const STAGES: [&str; 3] = ["outline", "dialogue", "voice"];

    let dir = TempDir::new().unwrap();
    let executor = Arc::new(CountingExecutor::default());
    let config = EngineConfig::new()
        .with_worker_config(WorkerPoolConfig {
            max_workers: 8,
            dequeue_timeout_ms: 20,
            stage_timeout_secs: 0,
        })
        .with_purge_config(PurgeConfig::new().with_enabled(false));
    let manager = PipelineManager::new(
        config,
        file_pool(&dir, 8).await,
        Arc::new(MemoryBroker::new()),
        executor.clone(),
    );
    manager.start();

    let priorities = [Priority::High, Priority::Normal, Priority::Low];
    let mut ids = Vec::with_capacity(PIPELINES);
    for i in 0..PIPELINES {
        let record = manager
            .submit(
                NewPipeline::new(format!("user-{}", i % 5), "{}", STAGES),
                priorities[i % priorities.len()],
            )
            .await
            .unwrap();
        ids.push(record.id);
    }

    for id in &ids {
        let mut done = None;
        for _ in 0..1000 {
            let record = manager.get_pipeline(id).await.unwrap();
            if record.status.is_terminal() {
                done = Some(record);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let record = done.unwrap_or_else(|| panic!("pipeline {id} did not finish"));
        assert_eq!(record.status, PipelineStatus::Completed);
        assert_eq!(record.progress, 100);
    }

    manager.shutdown().await;

    assert_eq!(executor.executions.len(), PIPELINES * STAGES.len());
    for entry in executor.executions.iter() {
        assert_eq!(*entry.value(), 1, "{:?} executed more than once", entry.key());
    }
}
