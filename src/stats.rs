// src/stats.rs
//! Run statistics and telemetry counters.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use serde::Serialize;

/// One-time metrics registration (so series show up on any recorder).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("pipeline_files_fetched_total", "Snapshot files downloaded.");
        describe_counter!("pipeline_records_parsed_total", "Records parsed from snapshots.");
        describe_counter!("pipeline_change_events_total", "Change events emitted.");
        describe_counter!("pipeline_artifacts_merged_total", "Artifacts merged into master.");
        describe_counter!("pipeline_files_archived_total", "Raw files archived.");
        describe_counter!("pipeline_transport_errors_total", "Per-file download failures.");
        describe_counter!(
            "pipeline_data_quality_errors_total",
            "Malformed lines, empty parses, out-of-order records."
        );
        describe_counter!(
            "pipeline_merge_consistency_errors_total",
            "Artifacts rejected by the merge conflict check."
        );
        describe_gauge!("pipeline_last_run_ts", "Unix ts when the pipeline last ran.");
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Success,
    /// Completed, but some files/records were skipped or some artifacts
    /// were held back. The master dataset is still consistent.
    Partial,
    Failed,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RunStats {
    pub files_fetched: usize,
    pub records_parsed: usize,
    pub change_events: usize,
    pub artifacts_merged: usize,
    pub files_archived: usize,
    pub transport_errors: usize,
    pub data_quality_errors: usize,
    pub merge_consistency_errors: usize,
    pub duration_ms: u64,
    /// Set when the run aborted on a fatal error before completing.
    pub failed: bool,
}

impl RunStats {
    pub fn status(&self) -> RunStatus {
        if self.failed {
            RunStatus::Failed
        } else if self.transport_errors + self.data_quality_errors + self.merge_consistency_errors > 0
        {
            RunStatus::Partial
        } else {
            RunStatus::Success
        }
    }

    /// Flush the per-run counts to the metrics facade.
    pub fn emit(&self) {
        ensure_metrics_described();
        counter!("pipeline_files_fetched_total").increment(self.files_fetched as u64);
        counter!("pipeline_records_parsed_total").increment(self.records_parsed as u64);
        counter!("pipeline_change_events_total").increment(self.change_events as u64);
        counter!("pipeline_artifacts_merged_total").increment(self.artifacts_merged as u64);
        counter!("pipeline_files_archived_total").increment(self.files_archived as u64);
        counter!("pipeline_transport_errors_total").increment(self.transport_errors as u64);
        counter!("pipeline_data_quality_errors_total").increment(self.data_quality_errors as u64);
        counter!("pipeline_merge_consistency_errors_total")
            .increment(self.merge_consistency_errors as u64);
        gauge!("pipeline_last_run_ts").set(chrono::Utc::now().timestamp().max(0) as f64);
    }
}
