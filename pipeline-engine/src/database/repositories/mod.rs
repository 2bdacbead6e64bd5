//! Repository layer for database access.
//!
//! The pipeline repository owns every state transition of a generation
//! pipeline; callers never write status or progress directly.

pub mod pipeline;

pub use pipeline::*;
