// src/fetch.rs
//! Fetcher: manifest-gated, bounded-concurrency snapshot downloads.
//!
//! Only `.txt` entries count as snapshots. An entry is downloaded when the
//! local manifest has never seen it or records a different size/mtime; a
//! lost manifest entry whose snapshot is already archived is skipped via
//! the archive manifest. Downloads land in a `.part` file and are renamed
//! on completion, so a crash never registers a half-written snapshot and a
//! re-run overwrites instead of duplicating.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::archive::ArchiveManifest;
use crate::config::FetchConfig;
use crate::error::{PipelineError, Result};
use crate::source::SnapshotSource;
use crate::state::{atomic_write_json, read_json_or_default};
use crate::types::{RemoteEntry, SnapshotId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ManifestEntry {
    size: u64,
    modified: Option<DateTime<Utc>>,
}

/// Durable record of what has been downloaded, keyed by remote path.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FetchManifest {
    entries: BTreeMap<String, ManifestEntry>,
}

impl FetchManifest {
    fn matches(&self, entry: &RemoteEntry) -> bool {
        self.entries
            .get(&entry.path)
            .map(|m| m.size == entry.size && m.modified == entry.modified)
            .unwrap_or(false)
    }

    fn record(&mut self, entry: &RemoteEntry) {
        self.entries.insert(
            entry.path.clone(),
            ManifestEntry {
                size: entry.size,
                modified: entry.modified,
            },
        );
    }

    fn known(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }
}

#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// Newly materialized snapshots, ready for the parser.
    pub fetched: Vec<(SnapshotId, RemoteEntry)>,
    pub skipped: usize,
    pub transport_errors: usize,
}

pub struct Fetcher {
    cfg: FetchConfig,
    staging_dir: PathBuf,
    manifest_path: PathBuf,
}

impl Fetcher {
    pub fn new(cfg: FetchConfig, staging_dir: PathBuf, manifest_path: PathBuf) -> Self {
        Self {
            cfg,
            staging_dir,
            manifest_path,
        }
    }

    pub async fn run(
        &self,
        source: Arc<dyn SnapshotSource>,
        archived: &ArchiveManifest,
    ) -> Result<FetchOutcome> {
        // Enumeration failure at the root aborts before any writes.
        let entries = source
            .list()
            .await
            .map_err(|e| PipelineError::fatal(format!("remote enumeration failed: {e}")))?;

        let mut manifest: FetchManifest = read_json_or_default(&self.manifest_path)?;
        std::fs::create_dir_all(&self.staging_dir)?;

        let mut outcome = FetchOutcome::default();
        let mut to_fetch = Vec::new();
        for entry in entries {
            if !entry.path.to_ascii_lowercase().ends_with(".txt") {
                continue;
            }
            if manifest.matches(&entry) {
                outcome.skipped += 1;
                continue;
            }
            let id = SnapshotId::from_remote_path(&entry.path);
            if !manifest.known(&entry.path) && archived.contains(&id) {
                // Manifest was lost but the snapshot is already downstream.
                outcome.skipped += 1;
                continue;
            }
            to_fetch.push((id, entry));
        }

        tracing::info!(
            source = source.name(),
            new = to_fetch.len(),
            skipped = outcome.skipped,
            "fetch plan"
        );

        let semaphore = Arc::new(Semaphore::new(self.cfg.concurrency.max(1)));
        let timeout = Duration::from_secs(self.cfg.timeout_secs);
        let attempts = self.cfg.attempts.max(1);

        let mut tasks: JoinSet<std::result::Result<(SnapshotId, RemoteEntry), String>> =
            JoinSet::new();
        for (id, entry) in to_fetch {
            let source = Arc::clone(&source);
            let semaphore = Arc::clone(&semaphore);
            let staging = self.staging_dir.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let mut last_err = String::new();
                for attempt in 1..=attempts {
                    match tokio::time::timeout(timeout, source.fetch(&entry.path)).await {
                        Ok(Ok(bytes)) => {
                            let final_path = staging.join(id.as_str());
                            let part = staging.join(format!("{}.part", id.as_str()));
                            if let Err(e) = tokio::fs::write(&part, &bytes).await {
                                return Err(format!("staging {}: {e}", entry.path));
                            }
                            if let Err(e) = tokio::fs::rename(&part, &final_path).await {
                                return Err(format!("staging {}: {e}", entry.path));
                            }
                            return Ok((id, entry));
                        }
                        Ok(Err(e)) => last_err = e.to_string(),
                        Err(_) => last_err = format!("timeout after {}s", timeout.as_secs()),
                    }
                    tracing::debug!(path = %entry.path, attempt, error = %last_err, "retrying download");
                }
                Err(format!("{}: {last_err}", entry.path))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((id, entry))) => {
                    manifest.record(&entry);
                    outcome.fetched.push((id, entry));
                }
                Ok(Err(msg)) => {
                    tracing::warn!(error = %msg, "download failed, skipping file");
                    outcome.transport_errors += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "download task panicked");
                    outcome.transport_errors += 1;
                }
            }
        }

        // One durable manifest write per run; a crash before this point
        // simply re-downloads and overwrites next time.
        atomic_write_json(&self.manifest_path, &manifest)?;

        outcome.fetched.sort_by(|a, b| a.1.path.cmp(&b.1.path));
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FsSource;

    fn write_remote(root: &std::path::Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn fetcher(dir: &std::path::Path) -> Fetcher {
        Fetcher::new(
            FetchConfig::default(),
            dir.join("staging"),
            dir.join("state/fetch_manifest.json"),
        )
    }

    #[tokio::test]
    async fn downloads_new_txt_entries_only() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = tmp.path().join("remote");
        write_remote(&remote, "loan/usa.txt", "#SYM|CUR\n");
        write_remote(&remote, "loan/readme.md", "not a snapshot");

        let f = fetcher(tmp.path());
        let out = f
            .run(Arc::new(FsSource::new(&remote)), &ArchiveManifest::default())
            .await
            .unwrap();
        assert_eq!(out.fetched.len(), 1);
        assert_eq!(out.transport_errors, 0);
        assert!(tmp.path().join("staging/loan__usa.txt").exists());
    }

    #[tokio::test]
    async fn second_run_skips_unchanged_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = tmp.path().join("remote");
        write_remote(&remote, "usa.txt", "#SYM|CUR\n");

        let f = fetcher(tmp.path());
        let src: Arc<dyn SnapshotSource> = Arc::new(FsSource::new(&remote));
        let first = f.run(Arc::clone(&src), &ArchiveManifest::default()).await.unwrap();
        assert_eq!(first.fetched.len(), 1);

        let second = f.run(Arc::clone(&src), &ArchiveManifest::default()).await.unwrap();
        assert!(second.fetched.is_empty());
        assert_eq!(second.skipped, 1);
    }

    #[tokio::test]
    async fn changed_entry_is_redownloaded_and_overwritten() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = tmp.path().join("remote");
        write_remote(&remote, "usa.txt", "v1 content");

        let f = fetcher(tmp.path());
        let src: Arc<dyn SnapshotSource> = Arc::new(FsSource::new(&remote));
        f.run(Arc::clone(&src), &ArchiveManifest::default()).await.unwrap();

        write_remote(&remote, "usa.txt", "v2 content longer");
        let out = f.run(Arc::clone(&src), &ArchiveManifest::default()).await.unwrap();
        assert_eq!(out.fetched.len(), 1);
        let staged = std::fs::read_to_string(tmp.path().join("staging/usa.txt")).unwrap();
        assert_eq!(staged, "v2 content longer");
    }

    #[tokio::test]
    async fn archived_snapshot_is_not_refetched_after_manifest_loss() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = tmp.path().join("remote");
        write_remote(&remote, "usa.txt", "#SYM|CUR\n");

        let mut archived = ArchiveManifest::default();
        archived.mark(SnapshotId::from_remote_path("usa.txt"));

        // Fresh fetcher with no manifest on disk.
        let f = fetcher(tmp.path());
        let out = f
            .run(Arc::new(FsSource::new(&remote)), &archived)
            .await
            .unwrap();
        assert!(out.fetched.is_empty());
        assert_eq!(out.skipped, 1);
    }

    #[tokio::test]
    async fn unreachable_root_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fetcher(tmp.path());
        let err = f
            .run(
                Arc::new(FsSource::new("/definitely/not/here")),
                &ArchiveManifest::default(),
            )
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
