//! Generation pipeline orchestration.
//!
//! - [`PipelineManager`] is the facade callers use: submit, cancel, observe
//! - [`Orchestrator`] runs one dequeued job through its stages
//! - [`WorkerPool`] runs the dequeue/orchestrate loop on N workers
//! - [`ProgressBroadcaster`] fans state changes out to subscribers
//! - [`PipelinePurgeService`] deletes expired terminal pipelines

mod executor;
mod manager;
mod orchestrator;
mod progress;
mod purge;
mod worker_pool;

pub use executor::{StageExecutor, StageOutcome, StageRequest};
pub use manager::PipelineManager;
pub use orchestrator::{JobOutcome, Orchestrator};
pub use progress::{ProgressBroadcaster, ProgressEvent, ProgressSubscription};
pub use purge::{PipelinePurgeService, PurgeConfig};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};
