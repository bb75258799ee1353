// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod archive;
pub mod compact;
pub mod config;
pub mod error;
pub mod fetch;
pub mod master;
pub mod parse;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod state;
pub mod stats;
pub mod track;
pub mod types;

// ---- Re-exports for stable public API ----
pub use crate::config::PipelineConfig;
pub use crate::error::PipelineError;
pub use crate::pipeline::{Pipeline, Stage};
pub use crate::stats::{RunStats, RunStatus};
pub use crate::types::{ChangeEvent, IdentityKey, ObservedFields, Record, SnapshotId};
