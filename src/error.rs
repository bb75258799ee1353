// src/error.rs
//! Error taxonomy for the pipeline.
//!
//! - `Transport`: remote listing/download failures. Per-file, retryable,
//!   non-fatal; counted and skipped.
//! - `DataQuality`: malformed line, out-of-order timestamp, empty parse
//!   result. Counted, record or file skipped, run continues.
//! - `MergeConsistency`: partial merge or conflicting rows for the same
//!   (key, valid_from). Blocks archival of the affected artifact only.
//! - `Fatal`: remote root unreachable, local storage unwritable, run lock
//!   held. Aborts before any state mutation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("data quality: {0}")]
    DataQuality(String),

    #[error("merge consistency: {0}")]
    MergeConsistency(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl PipelineError {
    pub fn transport(e: impl std::fmt::Display) -> Self {
        Self::Transport(e.to_string())
    }

    pub fn data_quality(e: impl std::fmt::Display) -> Self {
        Self::DataQuality(e.to_string())
    }

    pub fn merge_consistency(e: impl std::fmt::Display) -> Self {
        Self::MergeConsistency(e.to_string())
    }

    pub fn fatal(e: impl std::fmt::Display) -> Self {
        Self::Fatal(e.to_string())
    }

    /// Whether the error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Local storage failures abort before any state mutation.
impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        Self::Fatal(format!("local storage: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
