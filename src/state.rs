// src/state.rs
//! Per-snapshot lifecycle state and the run-level lock.
//!
//! Every downloaded snapshot moves through
//! `Fetched → Parsed → ChangeTracked → Compacted → Merged → Archived`.
//! Transitions are recorded durably, so resumption is driven by recorded
//! state: anything stuck before `Merged` is reprocessed from its staged
//! bytes on the next run; anything at `Merged` or later is never re-merged
//! except through the idempotent merge path.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::types::{RemoteEntry, SnapshotId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SnapshotState {
    Fetched,
    Parsed,
    ChangeTracked,
    Compacted,
    Merged,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub id: SnapshotId,
    pub remote_path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub state: SnapshotState,
}

/// Durable map of snapshot id → lifecycle entry, stored as sorted JSON.
#[derive(Debug, Default)]
pub struct StateStore {
    path: PathBuf,
    entries: BTreeMap<SnapshotId, SnapshotEntry>,
}

impl StateStore {
    pub fn load(path: PathBuf) -> Result<Self> {
        let entries = match fs::read_to_string(&path) {
            Ok(s) => {
                let list: Vec<SnapshotEntry> = serde_json::from_str(&s).map_err(|e| {
                    PipelineError::fatal(format!("corrupt state file {}: {e}", path.display()))
                })?;
                list.into_iter().map(|e| (e.id.clone(), e)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(PipelineError::fatal(format!(
                    "reading state file {}: {e}",
                    path.display()
                )))
            }
        };
        Ok(Self { path, entries })
    }

    pub fn get(&self, id: &SnapshotId) -> Option<&SnapshotEntry> {
        self.entries.get(id)
    }

    /// Register a freshly fetched snapshot. A re-download resets the entry
    /// to `Fetched` so the whole chain reruns against the new bytes.
    pub fn record_fetched(&mut self, id: SnapshotId, entry: &RemoteEntry) {
        self.entries.insert(
            id.clone(),
            SnapshotEntry {
                id,
                remote_path: entry.path.clone(),
                size: entry.size,
                modified: entry.modified,
                state: SnapshotState::Fetched,
            },
        );
    }

    /// Move a snapshot forward. Backward transitions are ignored so re-runs
    /// of an earlier stage cannot roll durable progress back.
    pub fn advance(&mut self, id: &SnapshotId, state: SnapshotState) {
        if let Some(e) = self.entries.get_mut(id) {
            if e.state < state {
                e.state = state;
            }
        }
    }

    pub fn in_state(&self, state: SnapshotState) -> Vec<SnapshotEntry> {
        self.entries
            .values()
            .filter(|e| e.state == state)
            .cloned()
            .collect()
    }

    pub fn persist(&self) -> Result<()> {
        let list: Vec<&SnapshotEntry> = self.entries.values().collect();
        atomic_write_json(&self.path, &list)
    }
}

/// Serialize → write `*.tmp` → fsync → rename, so a crash mid-write never
/// leaves a torn file visible to the next stage.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| PipelineError::fatal(format!("serializing {}: {e}", path.display())))?;
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a JSON state file; a missing file yields the default.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match fs::read_to_string(path) {
        Ok(s) => serde_json::from_str(&s)
            .map_err(|e| PipelineError::fatal(format!("corrupt state file {}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Run-level lock: concurrent runs against the same dataset root must
/// serialize merges. Held for the whole run, released on drop.
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join("run.lock");
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut f) => {
                let _ = writeln!(f, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(PipelineError::fatal(
                format!("another run holds {}", path.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
