// src/archive.rs
//! Archival of raw snapshots once they are durably merged.
//!
//! Ordering invariant: a snapshot id is written to the archive manifest (and
//! the manifest flushed) strictly before its staged bytes are relocated or
//! deleted. The manifest is also the fetcher's hint that an entry is already
//! represented downstream.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::state::{atomic_write_json, read_json_or_default};
use crate::types::SnapshotId;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ArchiveManifest {
    archived: BTreeSet<SnapshotId>,
}

impl ArchiveManifest {
    pub fn load(path: &Path) -> Result<Self> {
        read_json_or_default(path)
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self)
    }

    pub fn contains(&self, id: &SnapshotId) -> bool {
        self.archived.contains(id)
    }

    pub fn mark(&mut self, id: SnapshotId) {
        self.archived.insert(id);
    }

    pub fn len(&self) -> usize {
        self.archived.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archived.is_empty()
    }
}

/// Relocates (or deletes) staged snapshot files after their merge committed.
pub struct Archiver {
    archive_dir: PathBuf,
    delete: bool,
}

impl Archiver {
    pub fn new<P: Into<PathBuf>>(archive_dir: P, delete: bool) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            delete,
        }
    }

    /// Move the staged file out of staging. Only call this after the
    /// manifest entry for `id` is durably persisted.
    pub fn archive_file(&self, staged: &Path, id: &SnapshotId) -> Result<()> {
        if !staged.exists() {
            // Already relocated by an earlier, interrupted run.
            return Ok(());
        }
        if self.delete {
            fs::remove_file(staged)?;
            return Ok(());
        }
        fs::create_dir_all(&self.archive_dir)?;
        fs::rename(staged, self.archive_dir.join(id.as_str()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("archive_manifest.json");
        let id = SnapshotId::from_remote_path("loan/usa.txt");

        let mut manifest = ArchiveManifest::load(&path).unwrap();
        assert!(manifest.is_empty());
        manifest.mark(id.clone());
        manifest.persist(&path).unwrap();

        let reloaded = ArchiveManifest::load(&path).unwrap();
        assert!(reloaded.contains(&id));
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn relocation_moves_file_and_tolerates_reruns() {
        let tmp = tempfile::tempdir().unwrap();
        let staged = tmp.path().join("staging/usa.txt");
        fs::create_dir_all(staged.parent().unwrap()).unwrap();
        fs::write(&staged, b"raw").unwrap();

        let id = SnapshotId::from_remote_path("usa.txt");
        let archiver = Archiver::new(tmp.path().join("archive"), false);
        archiver.archive_file(&staged, &id).unwrap();

        assert!(!staged.exists());
        assert!(tmp.path().join("archive/usa.txt").exists());

        // Second call is a no-op, not an error.
        archiver.archive_file(&staged, &id).unwrap();
    }

    #[test]
    fn delete_mode_removes_instead_of_relocating() {
        let tmp = tempfile::tempdir().unwrap();
        let staged = tmp.path().join("usa.txt");
        fs::write(&staged, b"raw").unwrap();

        let archiver = Archiver::new(tmp.path().join("archive"), true);
        archiver
            .archive_file(&staged, &SnapshotId::from_remote_path("usa.txt"))
            .unwrap();
        assert!(!staged.exists());
        assert!(!tmp.path().join("archive").exists());
    }
}
