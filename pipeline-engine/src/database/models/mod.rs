//! Database models for the generation pipeline tables.
//!
//! These models map directly to the database schema. `config` and `results`
//! stay opaque JSON text at this layer.

pub mod pipeline;

pub use pipeline::*;
