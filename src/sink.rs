// src/sink.rs
//! Best-effort run-metadata reporting.
//!
//! The metadata collaborator is outside the pipeline's correctness
//! boundary: its unavailability must never fail a run, so callers go
//! through [`report_best_effort`].

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::stats::RunStats;

#[async_trait]
pub trait MetadataSink: Send + Sync {
    async fn record_run(&self, stats: &RunStats) -> Result<()>;
    fn name(&self) -> &'static str;
}

pub async fn report_best_effort(sink: &dyn MetadataSink, stats: &RunStats) {
    if let Err(e) = sink.record_run(stats).await {
        tracing::warn!(sink = sink.name(), error = ?e, "metadata reporting failed, continuing");
    }
}

/// POSTs run stats as JSON to a metadata endpoint.
pub struct HttpMetadataSink {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpMetadataSink {
    pub fn new<S: Into<String>>(endpoint: S) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MetadataSink for HttpMetadataSink {
    async fn record_run(&self, stats: &RunStats) -> Result<()> {
        self.client
            .post(&self.endpoint)
            .json(stats)
            .send()
            .await
            .context("posting run stats")?
            .error_for_status()
            .context("metadata endpoint rejected run stats")?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Discards everything; used when no endpoint is configured.
pub struct NullSink;

#[async_trait]
impl MetadataSink for NullSink {
    async fn record_run(&self, _stats: &RunStats) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

// --- Test helper ---
pub struct MockSink {
    pub calls: std::sync::Mutex<Vec<RunStats>>,
    pub fail: bool,
}

impl MockSink {
    pub fn new() -> Self {
        Self {
            calls: std::sync::Mutex::new(vec![]),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            calls: std::sync::Mutex::new(vec![]),
            fail: true,
        }
    }
}

impl Default for MockSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataSink for MockSink {
    async fn record_run(&self, stats: &RunStats) -> Result<()> {
        if self.fail {
            anyhow::bail!("mock sink down");
        }
        self.calls.lock().unwrap().push(stats.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn best_effort_swallows_sink_failure() {
        let sink = MockSink::failing();
        report_best_effort(&sink, &RunStats::default()).await;
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn mock_sink_records_calls() {
        let sink = MockSink::new();
        report_best_effort(&sink, &RunStats::default()).await;
        assert_eq!(sink.calls.lock().unwrap().len(), 1);
    }
}
