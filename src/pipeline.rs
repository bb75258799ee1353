// src/pipeline.rs
//! Stage orchestration.
//!
//! Stages run in strict order: fetch → process (parse + change-track) →
//! compact → merge/archive. Each stage reads only the durable output of the
//! previous one and records per-snapshot progress in the state store, so any
//! stage can be re-run standalone and a crash between stages resumes cleanly
//! from recorded state rather than from whichever flag was passed last.

use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use crate::archive::{ArchiveManifest, Archiver};
use crate::compact::CompactStore;
use crate::config::{PipelineConfig, SourceConfig};
use crate::error::PipelineError;
use crate::fetch::Fetcher;
use crate::master::MasterStore;
use crate::parse::{country_from_path, parse_snapshot};
use crate::sink::{report_best_effort, HttpMetadataSink, MetadataSink, NullSink};
use crate::source::{FsSource, HttpSource, SnapshotSource};
use crate::state::{atomic_write_json, read_json_or_default, RunLock, SnapshotState, StateStore};
use crate::stats::RunStats;
use crate::track::ChangeTracker;
use crate::types::{ChangeEvent, SnapshotId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Process,
    Compact,
    Merge,
    All,
}

impl Stage {
    pub fn parse(arg: &str) -> Option<Self> {
        match arg {
            "fetch" => Some(Self::Fetch),
            "process" => Some(Self::Process),
            "compact" => Some(Self::Compact),
            "merge" => Some(Self::Merge),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

pub struct Pipeline {
    cfg: PipelineConfig,
    source: Arc<dyn SnapshotSource>,
    sink: Arc<dyn MetadataSink>,
}

impl Pipeline {
    pub fn new(
        cfg: PipelineConfig,
        source: Arc<dyn SnapshotSource>,
        sink: Arc<dyn MetadataSink>,
    ) -> Self {
        Self { cfg, source, sink }
    }

    /// Wire source and sink straight from configuration.
    pub fn from_config(cfg: PipelineConfig) -> Self {
        let source: Arc<dyn SnapshotSource> = match &cfg.source {
            SourceConfig::Fs { root } => Arc::new(FsSource::new(root.clone())),
            SourceConfig::Http { base_url } => Arc::new(HttpSource::new(base_url.clone())),
        };
        let sink: Arc<dyn MetadataSink> = match &cfg.metadata_endpoint {
            Some(endpoint) => Arc::new(HttpMetadataSink::new(endpoint.clone())),
            None => Arc::new(NullSink),
        };
        Self::new(cfg, source, sink)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    /// Run one stage (or the whole chain) under the run lock.
    pub async fn run(&self, stage: Stage) -> Result<RunStats> {
        let started = Instant::now();
        let _lock = RunLock::acquire(&self.cfg.state_dir())?;

        let mut store = StateStore::load(self.cfg.snapshot_state_path())?;
        let mut stats = RunStats::default();

        let result = self.run_stages(stage, &mut store, &mut stats).await;

        stats.duration_ms = started.elapsed().as_millis() as u64;
        stats.failed = result.is_err();
        stats.emit();
        report_best_effort(&*self.sink, &stats).await;

        match result {
            Ok(()) => {
                tracing::info!(
                    status = ?stats.status(),
                    fetched = stats.files_fetched,
                    parsed = stats.records_parsed,
                    events = stats.change_events,
                    merged = stats.artifacts_merged,
                    archived = stats.files_archived,
                    transport_errors = stats.transport_errors,
                    data_quality_errors = stats.data_quality_errors,
                    merge_consistency_errors = stats.merge_consistency_errors,
                    duration_ms = stats.duration_ms,
                    "run complete"
                );
                Ok(stats)
            }
            Err(e) => {
                tracing::error!(error = %e, "run aborted");
                Err(e.into())
            }
        }
    }

    async fn run_stages(
        &self,
        stage: Stage,
        store: &mut StateStore,
        stats: &mut RunStats,
    ) -> std::result::Result<(), PipelineError> {
        match stage {
            Stage::Fetch => self.fetch_stage(store, stats).await,
            Stage::Process => self.process_stage(store, stats),
            Stage::Compact => self.compact_stage(store, stats),
            Stage::Merge => self.merge_stage(store, stats),
            Stage::All => {
                self.fetch_stage(store, stats).await?;
                self.process_stage(store, stats)?;
                self.compact_stage(store, stats)?;
                self.merge_stage(store, stats)
            }
        }
    }

    // ── Stage 1: fetch ──────────────────────────────────────────────

    async fn fetch_stage(
        &self,
        store: &mut StateStore,
        stats: &mut RunStats,
    ) -> std::result::Result<(), PipelineError> {
        let archived = ArchiveManifest::load(&self.cfg.archive_manifest_path())?;
        let fetcher = Fetcher::new(
            self.cfg.fetch.clone(),
            self.cfg.staging_dir(),
            self.cfg.fetch_manifest_path(),
        );
        let outcome = fetcher.run(Arc::clone(&self.source), &archived).await?;

        for (id, entry) in &outcome.fetched {
            store.record_fetched(id.clone(), entry);
        }
        store.persist()?;

        stats.files_fetched += outcome.fetched.len();
        stats.transport_errors += outcome.transport_errors;
        Ok(())
    }

    // ── Stage 2: parse + change-track ───────────────────────────────

    fn process_stage(
        &self,
        store: &mut StateStore,
        stats: &mut RunStats,
    ) -> std::result::Result<(), PipelineError> {
        let mut pending = store.in_state(SnapshotState::Fetched);
        pending.extend(store.in_state(SnapshotState::Parsed));
        if pending.is_empty() {
            return Ok(());
        }

        // Parse everything first so tracking can run in capture-time order
        // across files; out-of-order input within a key is still rejected.
        let mut parsed = Vec::new();
        for entry in pending {
            let staged = self.cfg.staging_dir().join(entry.id.as_str());
            let text = match std::fs::read_to_string(&staged) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(id = %entry.id, error = %e, "staged file unreadable, skipping");
                    stats.data_quality_errors += 1;
                    continue;
                }
            };
            let country = country_from_path(&entry.remote_path);
            let fallback = entry.modified.unwrap_or_else(chrono::Utc::now);
            match parse_snapshot(&text, &country, fallback) {
                Ok(snapshot) => {
                    stats.records_parsed += snapshot.records.len();
                    stats.data_quality_errors += snapshot.skipped_lines;
                    store.advance(&entry.id, SnapshotState::Parsed);
                    parsed.push((entry.id.clone(), snapshot));
                }
                Err(e) => {
                    tracing::warn!(id = %entry.id, error = %e, "snapshot failed parsing");
                    stats.data_quality_errors += 1;
                }
            }
        }
        store.persist()?;
        parsed.sort_by(|a, b| (a.1.captured_at, &a.0).cmp(&(b.1.captured_at, &b.0)));

        // The last-known map is derived state: rebuild it from the master
        // dataset plus any events not yet folded into it.
        let master = MasterStore::new(self.cfg.master_path()).load()?;
        let mut replay: Vec<ChangeEvent> = master.iter_events().collect();
        for state in [SnapshotState::ChangeTracked, SnapshotState::Compacted] {
            for entry in store.in_state(state) {
                replay.extend(self.load_events(&entry.id)?);
            }
        }
        let mut tracker = ChangeTracker::from_events(replay);

        for (id, snapshot) in parsed {
            let outcome = tracker.track(snapshot.records);
            stats.change_events += outcome.events.len();
            stats.data_quality_errors += outcome.out_of_order;
            tracing::info!(
                id = %id,
                events = outcome.events.len(),
                suppressed = outcome.suppressed,
                out_of_order = outcome.out_of_order,
                "change-tracked snapshot"
            );
            atomic_write_json(&self.events_path(&id), &outcome.events)?;
            store.advance(&id, SnapshotState::ChangeTracked);
            store.persist()?;
        }

        tracker.persist(&self.cfg.last_known_path())?;
        Ok(())
    }

    // ── Stage 3: compact ────────────────────────────────────────────

    fn compact_stage(
        &self,
        store: &mut StateStore,
        _stats: &mut RunStats,
    ) -> std::result::Result<(), PipelineError> {
        let pending = store.in_state(SnapshotState::ChangeTracked);
        if pending.is_empty() {
            return Ok(());
        }

        let mut batch = Vec::with_capacity(pending.len());
        for entry in &pending {
            batch.push((entry.id.clone(), self.load_events(&entry.id)?));
        }

        let compact_store = CompactStore::new(self.cfg.compacted_dir());
        let touched = compact_store.upsert(&batch)?;
        tracing::info!(snapshots = batch.len(), windows = touched.len(), "compacted");

        for entry in &pending {
            store.advance(&entry.id, SnapshotState::Compacted);
        }
        store.persist()?;
        Ok(())
    }

    // ── Stage 4: merge + archive ────────────────────────────────────

    fn merge_stage(
        &self,
        store: &mut StateStore,
        stats: &mut RunStats,
    ) -> std::result::Result<(), PipelineError> {
        let master_store = MasterStore::new(self.cfg.master_path());
        let mut master = master_store.load()?;

        // Merge every artifact each run; the union is idempotent, so
        // re-merging already-applied windows is harmless.
        let mut blocked: BTreeSet<SnapshotId> = BTreeSet::new();
        for artifact in CompactStore::new(self.cfg.compacted_dir()).load_all()? {
            match master.merge(&artifact) {
                Ok(outcome) => {
                    stats.artifacts_merged += 1;
                    tracing::debug!(
                        window = %artifact.window,
                        inserted = outcome.inserted,
                        duplicates = outcome.duplicates,
                        "merged artifact"
                    );
                }
                Err(e) => {
                    tracing::warn!(window = %artifact.window, error = %e, "artifact rejected");
                    stats.merge_consistency_errors += 1;
                    blocked.extend(artifact.sources.iter().cloned());
                }
            }
        }

        // Commit point: the master hits disk atomically before anything
        // downstream of it is allowed to advance.
        master_store.persist(&master)?;

        for entry in store.in_state(SnapshotState::Compacted) {
            if !blocked.contains(&entry.id) {
                store.advance(&entry.id, SnapshotState::Merged);
            }
        }
        store.persist()?;

        // Archive: manifest first, relocation second (commit-before-archive).
        let manifest_path = self.cfg.archive_manifest_path();
        let mut manifest = ArchiveManifest::load(&manifest_path)?;
        let to_archive = store.in_state(SnapshotState::Merged);
        if to_archive.is_empty() {
            return Ok(());
        }
        for entry in &to_archive {
            manifest.mark(entry.id.clone());
        }
        manifest.persist(&manifest_path)?;

        let archiver = Archiver::new(self.cfg.archive_dir(), self.cfg.archive.delete);
        for entry in &to_archive {
            let staged = self.cfg.staging_dir().join(entry.id.as_str());
            archiver.archive_file(&staged, &entry.id)?;
            let _ = std::fs::remove_file(self.events_path(&entry.id));
            store.advance(&entry.id, SnapshotState::Archived);
            stats.files_archived += 1;
        }
        store.persist()?;
        Ok(())
    }

    // ── helpers ─────────────────────────────────────────────────────

    fn events_path(&self, id: &SnapshotId) -> std::path::PathBuf {
        self.cfg.events_dir().join(format!("{id}.json"))
    }

    fn load_events(&self, id: &SnapshotId) -> std::result::Result<Vec<ChangeEvent>, PipelineError> {
        read_json_or_default(&self.events_path(id))
    }
}
