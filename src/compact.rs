// src/compact.rs
//! Compaction: per-window dedup of change events across file boundaries.
//!
//! The change tracker already suppresses no-op observations within its own
//! stream; compaction removes the duplication that overlapping fetch windows
//! introduce *between* streams. Events are grouped into UTC calendar-day
//! windows, sorted per key, and adjacent events with identical tracked
//! fields collapse to the earliest validity start. Compacting an
//! already-compacted artifact yields the same artifact.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::error::Result;
use crate::state::atomic_write_json;
use crate::types::{ChangeEvent, IdentityKey, SnapshotId};

/// One calendar-day window of deduplicated change events, plus the staged
/// snapshots that contributed to it (consulted when gating archival).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactedArtifact {
    pub window: NaiveDate,
    pub sources: BTreeSet<SnapshotId>,
    pub events: Vec<ChangeEvent>,
}

/// Deduplicate and collapse one window's worth of events.
///
/// Exact (key, valid_from) duplicates keep the last occurrence; adjacent
/// events per key whose tracked fields are identical collapse to the
/// earliest. Output is sorted by (key, valid_from).
pub fn compact_window(events: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
    let mut by_key_ts: BTreeMap<(IdentityKey, DateTime<Utc>), ChangeEvent> = BTreeMap::new();
    for ev in events {
        by_key_ts.insert((ev.key.clone(), ev.valid_from), ev);
    }

    let mut out: Vec<ChangeEvent> = Vec::with_capacity(by_key_ts.len());
    for ((key, _), ev) in by_key_ts {
        match out.last() {
            Some(prev) if prev.key == key && prev.observed.tracked_eq(&ev.observed) => {
                // Redundant successor; the earlier event already covers it.
            }
            _ => out.push(ev),
        }
    }
    out
}

/// Split events into calendar-day windows and compact each.
pub fn compact(events: Vec<ChangeEvent>) -> BTreeMap<NaiveDate, Vec<ChangeEvent>> {
    let mut windows: BTreeMap<NaiveDate, Vec<ChangeEvent>> = BTreeMap::new();
    for ev in events {
        windows.entry(ev.valid_from.date_naive()).or_default().push(ev);
    }
    windows
        .into_iter()
        .map(|(w, evs)| (w, compact_window(evs)))
        .collect()
}

/// Durable store of per-window artifacts under `compacted/YYYY-MM-DD.json`.
pub struct CompactStore {
    dir: PathBuf,
}

impl CompactStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, window: NaiveDate) -> PathBuf {
        self.dir.join(format!("{window}.json"))
    }

    pub fn load_window(&self, window: NaiveDate) -> Result<Option<CompactedArtifact>> {
        let path = self.path_for(window);
        if !path.exists() {
            return Ok(None);
        }
        let artifact: CompactedArtifact = read_json_or_default_artifact(&path)?;
        Ok(Some(artifact))
    }

    pub fn load_all(&self) -> Result<Vec<CompactedArtifact>> {
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
            .collect();
        paths.sort();
        for path in paths {
            out.push(read_json_or_default_artifact(&path)?);
        }
        Ok(out)
    }

    /// Fold a batch of change events into the window artifacts on disk.
    /// Existing artifact events are unioned in first, so re-running over the
    /// same batch is idempotent. Returns the windows that were touched.
    pub fn upsert(&self, batch: &[(SnapshotId, Vec<ChangeEvent>)]) -> Result<Vec<NaiveDate>> {
        // Window → (events, contributing snapshot ids) for the new batch.
        let mut incoming: BTreeMap<NaiveDate, (Vec<ChangeEvent>, BTreeSet<SnapshotId>)> =
            BTreeMap::new();
        for (id, events) in batch {
            for ev in events {
                let slot = incoming.entry(ev.valid_from.date_naive()).or_default();
                slot.0.push(ev.clone());
                slot.1.insert(id.clone());
            }
        }

        let mut touched = Vec::with_capacity(incoming.len());
        for (window, (mut events, mut sources)) in incoming {
            if let Some(existing) = self.load_window(window)? {
                events.extend(existing.events);
                sources.extend(existing.sources);
            }
            let artifact = CompactedArtifact {
                window,
                sources,
                events: compact_window(events),
            };
            atomic_write_json(&self.path_for(window), &artifact)?;
            touched.push(window);
        }
        Ok(touched)
    }
}

fn read_json_or_default_artifact(path: &std::path::Path) -> Result<CompactedArtifact> {
    // Artifacts have no meaningful default; reuse the strict read path.
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| {
        crate::error::PipelineError::merge_consistency(format!(
            "corrupt artifact {}: {e}",
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObservedFields;
    use chrono::{TimeZone, Timelike};

    fn ev(sym: &str, fee: f64, day: u32, hour: u32) -> ChangeEvent {
        ChangeEvent {
            key: IdentityKey::new(sym, "USD"),
            observed: ObservedFields {
                fee_rate: Some(fee),
                ..Default::default()
            },
            valid_from: Utc.with_ymd_and_hms(2025, 4, day, hour, 0, 0).unwrap(),
        }
    }

    #[test]
    fn compaction_is_idempotent() {
        let events = vec![
            ev("AAA", 5.0, 14, 1),
            ev("AAA", 5.0, 14, 2), // redundant successor
            ev("AAA", 7.0, 14, 3),
            ev("BBB", 1.0, 14, 1),
        ];
        let once = compact_window(events);
        let twice = compact_window(once.clone());
        assert_eq!(once, twice);
        assert_eq!(once.len(), 3);
        assert_eq!(once[0].valid_from.hour(), 1);
    }

    #[test]
    fn exact_duplicates_collapse_to_one() {
        let events = vec![ev("AAA", 7.0, 14, 3), ev("AAA", 7.0, 14, 3)];
        assert_eq!(compact_window(events).len(), 1);
    }

    #[test]
    fn events_split_into_daily_windows() {
        let windows = compact(vec![ev("AAA", 5.0, 14, 1), ev("AAA", 7.0, 15, 1)]);
        assert_eq!(windows.len(), 2);
        assert!(windows.contains_key(&NaiveDate::from_ymd_opt(2025, 4, 14).unwrap()));
        assert!(windows.contains_key(&NaiveDate::from_ymd_opt(2025, 4, 15).unwrap()));
    }

    #[test]
    fn upsert_unions_with_existing_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CompactStore::new(tmp.path());
        let id_a = SnapshotId::from_remote_path("a.txt");
        let id_b = SnapshotId::from_remote_path("b.txt");

        store
            .upsert(&[(id_a.clone(), vec![ev("AAA", 5.0, 14, 1)])])
            .unwrap();
        store
            .upsert(&[(id_b.clone(), vec![ev("AAA", 5.0, 14, 1), ev("AAA", 7.0, 14, 3)])])
            .unwrap();

        let artifact = store
            .load_window(NaiveDate::from_ymd_opt(2025, 4, 14).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(artifact.events.len(), 2);
        assert!(artifact.sources.contains(&id_a));
        assert!(artifact.sources.contains(&id_b));

        // Re-running the same upsert changes nothing.
        store
            .upsert(&[(id_b.clone(), vec![ev("AAA", 5.0, 14, 1), ev("AAA", 7.0, 14, 3)])])
            .unwrap();
        let again = store
            .load_window(NaiveDate::from_ymd_opt(2025, 4, 14).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(again, artifact);
    }
}
