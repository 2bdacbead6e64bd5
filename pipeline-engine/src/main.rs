use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use pipeline_engine::config::EngineConfig;
use pipeline_engine::logging;
use pipeline_engine::pipeline::{PipelineManager, StageExecutor, StageOutcome, StageRequest};

/// Completes every stage immediately, echoing the stage name as its result.
///
/// Stands in for the content-generation service when the engine runs alone.
struct PassthroughExecutor;

#[async_trait]
impl StageExecutor for PassthroughExecutor {
    async fn execute(&self, request: StageRequest) -> pipeline_engine::Result<StageOutcome> {
        tracing::debug!(
            pipeline_id = %request.pipeline_id,
            stage = %request.stage_name,
            "Passthrough stage"
        );
        Ok(StageOutcome::completed(request.stage_name))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env()?;

    let (logging_config, _guard) = logging::init_logging(config.log_dir.as_deref().map(Path::new))?;

    let manager = PipelineManager::connect(config, Arc::new(PassthroughExecutor)).await?;
    manager.start();

    let shutdown = tokio_util::sync::CancellationToken::new();
    logging_config.start_retention_cleanup(shutdown.clone());

    tracing::info!(
        workers = manager.config().worker.max_workers,
        key_prefix = %manager.config().queue.key_prefix,
        "pipeline-engine running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    shutdown.cancel();
    manager.shutdown().await;

    Ok(())
}
