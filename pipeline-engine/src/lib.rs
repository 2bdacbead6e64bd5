//! pipeline-engine library crate.
//!
//! Priority job queue, durable pipeline/stage state machine and progress
//! fan-out for long-running content generation jobs.

pub mod broker;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod utils;

pub use error::{Error, Result};
