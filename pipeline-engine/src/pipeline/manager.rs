//! Pipeline Manager: the engine's public facade.
//!
//! Owns the queue, record store, progress broadcaster, worker pool and purge
//! service, and exposes submission, cancellation and observation.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::executor::StageExecutor;
use super::orchestrator::Orchestrator;
use super::progress::{ProgressBroadcaster, ProgressEvent, ProgressSubscription};
use super::purge::PipelinePurgeService;
use super::worker_pool::WorkerPool;
use crate::Result;
use crate::broker::{Broker, MemoryBroker};
use crate::config::EngineConfig;
use crate::database::models::{
    NewPipeline, PipelineDbModel, PipelineSnapshot, PipelineStageDbModel, PipelineStatus,
};
use crate::database::repositories::{PipelineRepository, SqlxPipelineRepository};
use crate::database::{self, DbPool};
use crate::queue::{Priority, PriorityQueue, QueueDepthStatus};

/// The Pipeline Manager service.
pub struct PipelineManager {
    config: EngineConfig,
    broker: Arc<dyn Broker>,
    store: Arc<dyn PipelineRepository>,
    queue: Arc<PriorityQueue>,
    broadcaster: Arc<ProgressBroadcaster>,
    orchestrator: Arc<Orchestrator>,
    workers: WorkerPool,
    purge_service: Arc<PipelinePurgeService>,
    cancellation_token: CancellationToken,
    purge_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PipelineManager {
    /// Build a manager over a SQLite pool whose migrations have been applied.
    pub fn new(
        config: EngineConfig,
        pool: DbPool,
        broker: Arc<dyn Broker>,
        executor: Arc<dyn StageExecutor>,
    ) -> Self {
        let store = Arc::new(SqlxPipelineRepository::new(pool).with_ttl(config.purge.ttl()));
        Self::with_repository(config, store, broker, executor)
    }

    /// Build a manager over any record store.
    pub fn with_repository(
        config: EngineConfig,
        store: Arc<dyn PipelineRepository>,
        broker: Arc<dyn Broker>,
        executor: Arc<dyn StageExecutor>,
    ) -> Self {
        let queue = Arc::new(PriorityQueue::with_config(
            broker.clone(),
            config.queue.clone(),
        ));
        let broadcaster = Arc::new(ProgressBroadcaster::new(
            broker.clone(),
            config.queue.key_prefix.clone(),
        ));
        let orchestrator = Arc::new(
            Orchestrator::new(store.clone(), broadcaster.clone(), executor)
                .with_stage_timeout(config.worker.stage_timeout()),
        );
        let purge_service = Arc::new(PipelinePurgeService::new(
            config.purge.clone(),
            store.clone(),
        ));

        Self {
            workers: WorkerPool::with_config(config.worker.clone()),
            config,
            broker,
            store,
            queue,
            broadcaster,
            orchestrator,
            purge_service,
            cancellation_token: CancellationToken::new(),
            purge_task: parking_lot::Mutex::new(None),
        }
    }

    /// Open the configured database, apply migrations and use an in-process broker.
    pub async fn connect(config: EngineConfig, executor: Arc<dyn StageExecutor>) -> Result<Self> {
        config.validate()?;
        let pool = database::init_pool(&config.database_url).await?;
        database::run_migrations(&pool).await?;
        let broker = Arc::new(MemoryBroker::with_capacity(config.broker.channel_capacity));
        Ok(Self::new(config, pool, broker, executor))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the workers and, if enabled, the purge service.
    pub fn start(&self) {
        info!("Starting Pipeline Manager");

        self.workers
            .start(self.queue.clone(), self.orchestrator.clone());

        if self.config.purge.enabled {
            let handle = self
                .purge_service
                .clone()
                .start_background_task(self.cancellation_token.child_token());
            *self.purge_task.lock() = Some(handle);
        }

        info!("Pipeline Manager started");
    }

    /// Stop accepting work, let in-flight pipelines finish, then close the broker.
    ///
    /// Subscriptions end once the broker closes.
    pub async fn shutdown(&self) {
        info!("Stopping Pipeline Manager");
        self.cancellation_token.cancel();

        self.workers.stop().await;

        let purge_task = self.purge_task.lock().take();
        if let Some(handle) = purge_task
            && let Err(e) = handle.await
        {
            error!("Purge task ended abnormally: {}", e);
        }

        self.broker.close();
        info!("Pipeline Manager stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }

    /// Workers currently running a pipeline.
    pub fn active_workers(&self) -> usize {
        self.workers.active_count()
    }

    /// Create a pipeline and queue it for processing.
    ///
    /// If the reference cannot be queued the record is marked failed and the
    /// broker error is returned.
    pub async fn submit(
        &self,
        request: NewPipeline,
        priority: Priority,
    ) -> Result<PipelineDbModel> {
        let record = self.store.create_pipeline(&request).await?;
        // Published before enqueueing so it always precedes the worker's events.
        self.broadcaster
            .publish(&record.id, &ProgressEvent::from_record(&record))
            .await;

        let job_id = Uuid::new_v4().to_string();
        match self.queue.enqueue(job_id, record.id.clone(), priority).await {
            Ok(job) => {
                info!(
                    pipeline_id = %record.id,
                    job_id = %job.job_id,
                    user_id = %record.user_id,
                    priority = %priority,
                    stages = request.stages.len(),
                    "Pipeline submitted"
                );
                Ok(record)
            }
            Err(e) => {
                error!(pipeline_id = %record.id, error = %e, "Failed to enqueue pipeline");
                let message = format!("Failed to enqueue: {e}");
                match self
                    .store
                    .finalize(&record.id, PipelineStatus::Failed, None, Some(&message))
                    .await
                {
                    Ok(_) => self.publish_current(&record.id).await,
                    Err(finalize_err) => warn!(
                        pipeline_id = %record.id,
                        error = %finalize_err,
                        "Failed to mark unqueued pipeline as failed"
                    ),
                }
                Err(e)
            }
        }
    }

    /// Cancel a pipeline.
    ///
    /// A queued pipeline never starts. A running pipeline stops before its next
    /// stage; the stage in progress is not interrupted. Returns `false` if the
    /// pipeline was already terminal.
    pub async fn cancel(&self, pipeline_id: &str) -> Result<bool> {
        match self.queue.remove_pipeline(pipeline_id).await {
            Ok(removed) => {
                if removed {
                    info!(pipeline_id = %pipeline_id, "Removed queued pipeline");
                }
            }
            // The claim guard still stops it from running.
            Err(e) => warn!(
                pipeline_id = %pipeline_id,
                error = %e,
                "Could not remove pipeline from queue"
            ),
        }

        let cancelled = self.store.cancel(pipeline_id).await?;
        if cancelled {
            info!(pipeline_id = %pipeline_id, "Pipeline cancelled");
            self.publish_current(pipeline_id).await;
        }
        Ok(cancelled)
    }

    pub async fn get_pipeline(&self, pipeline_id: &str) -> Result<PipelineDbModel> {
        self.store.get_pipeline(pipeline_id).await
    }

    pub async fn list_stages(&self, pipeline_id: &str) -> Result<Vec<PipelineStageDbModel>> {
        self.store.list_stages(pipeline_id).await
    }

    /// Record plus stages. Read this before streaming events to reconcile.
    pub async fn snapshot(&self, pipeline_id: &str) -> Result<PipelineSnapshot> {
        self.store.snapshot(pipeline_id).await
    }

    /// Most recent pipelines of a user, newest first.
    pub async fn list_pipelines_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<PipelineDbModel>> {
        self.store.list_pipelines_for_user(user_id, limit).await
    }

    /// Attach the produced asset to a pipeline.
    pub async fn link_asset(&self, pipeline_id: &str, asset_id: &str) -> Result<()> {
        self.store.link_asset(pipeline_id, asset_id).await
    }

    pub async fn subscribe(&self, pipeline_id: &str) -> Result<ProgressSubscription> {
        self.broadcaster.subscribe(pipeline_id).await
    }

    pub async fn subscribe_all(&self) -> Result<ProgressSubscription> {
        self.broadcaster.subscribe_all().await
    }

    pub fn unsubscribe(&self, subscription: ProgressSubscription) {
        self.broadcaster.unsubscribe(subscription);
    }

    pub async fn queue_length(&self, priority: Priority) -> Result<usize> {
        self.queue.queue_length(priority).await
    }

    pub async fn total_queue_length(&self) -> Result<usize> {
        self.queue.total_queue_length().await
    }

    pub async fn depth_status(&self) -> Result<QueueDepthStatus> {
        self.queue.depth_status().await
    }

    /// Run one purge pass now, regardless of the background schedule.
    pub async fn purge_expired(&self) -> Result<u64> {
        self.purge_service.run_purge().await
    }

    async fn publish_current(&self, pipeline_id: &str) {
        match self.store.get_pipeline(pipeline_id).await {
            Ok(record) => {
                self.broadcaster
                    .publish(pipeline_id, &ProgressEvent::from_record(&record))
                    .await
            }
            Err(e) => warn!(
                pipeline_id = %pipeline_id,
                error = %e,
                "Could not load pipeline for progress event"
            ),
        }
    }
}
