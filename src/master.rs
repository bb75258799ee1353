// src/master.rs
//! The master dataset: cumulative union of all compacted artifacts.
//!
//! Keyed by (identity key, validity-start); merge is a pure set-union, so
//! it is idempotent and commutative. Persistence goes through the atomic
//! tmp→fsync→rename path, so readers and the next run only ever see either
//! the previous dataset or the fully merged one, never a torn mix.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::compact::CompactedArtifact;
use crate::error::{PipelineError, Result};
use crate::state::{atomic_write_json, read_json_or_default};
use crate::types::{ChangeEvent, IdentityKey, ObservedFields};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MasterDataset {
    rows: BTreeMap<(IdentityKey, DateTime<Utc>), ObservedFields>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MergeOutcome {
    pub inserted: usize,
    /// Rows already present with identical fields (idempotent re-merge).
    pub duplicates: usize,
}

impl MasterDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let events: Vec<ChangeEvent> = read_json_or_default(path)?;
        let mut rows = BTreeMap::new();
        for ev in events {
            rows.insert((ev.key, ev.valid_from), ev.observed);
        }
        Ok(Self { rows })
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        let events: Vec<ChangeEvent> = self.iter_events().collect();
        atomic_write_json(path, &events)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &IdentityKey, valid_from: DateTime<Utc>) -> Option<&ObservedFields> {
        self.rows.get(&(key.clone(), valid_from))
    }

    /// All rows as change events, in deterministic (key, valid_from) order.
    pub fn iter_events(&self) -> impl Iterator<Item = ChangeEvent> + '_ {
        self.rows.iter().map(|((key, ts), observed)| ChangeEvent {
            key: key.clone(),
            observed: observed.clone(),
            valid_from: *ts,
        })
    }

    /// Set-union of one artifact into the dataset.
    ///
    /// All-or-nothing: conflicts are detected in a first pass before any row
    /// is applied, so a rejected artifact leaves the dataset untouched and
    /// can be reapplied wholesale after the conflict is resolved.
    pub fn merge(&mut self, artifact: &CompactedArtifact) -> Result<MergeOutcome> {
        for ev in &artifact.events {
            if let Some(existing) = self.rows.get(&(ev.key.clone(), ev.valid_from)) {
                if existing != &ev.observed {
                    return Err(PipelineError::merge_consistency(format!(
                        "conflicting fields for {} at {} in window {}",
                        ev.key, ev.valid_from, artifact.window
                    )));
                }
            }
        }

        let mut outcome = MergeOutcome::default();
        for ev in &artifact.events {
            match self.rows.insert((ev.key.clone(), ev.valid_from), ev.observed.clone()) {
                None => outcome.inserted += 1,
                Some(_) => outcome.duplicates += 1,
            }
        }
        Ok(outcome)
    }

    /// The most recent event per key; this is what the change tracker
    /// rebuilds its last-known map from after a disaster.
    pub fn latest_per_key(&self) -> BTreeMap<IdentityKey, ChangeEvent> {
        let mut out: BTreeMap<IdentityKey, ChangeEvent> = BTreeMap::new();
        for ev in self.iter_events() {
            // Rows iterate in ascending valid_from per key, so the last
            // insert per key wins.
            out.insert(ev.key.clone(), ev);
        }
        out
    }
}

/// Convenience handle pairing the dataset with its on-disk location.
pub struct MasterStore {
    path: PathBuf,
}

impl MasterStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<MasterDataset> {
        MasterDataset::load(&self.path)
    }

    pub fn persist(&self, master: &MasterDataset) -> Result<()> {
        master.persist(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn ev(sym: &str, fee: f64, hour: u32) -> ChangeEvent {
        ChangeEvent {
            key: IdentityKey::new(sym, "USD"),
            observed: ObservedFields {
                fee_rate: Some(fee),
                ..Default::default()
            },
            valid_from: Utc.with_ymd_and_hms(2025, 4, 14, hour, 0, 0).unwrap(),
        }
    }

    fn artifact(events: Vec<ChangeEvent>) -> CompactedArtifact {
        CompactedArtifact {
            window: chrono::NaiveDate::from_ymd_opt(2025, 4, 14).unwrap(),
            sources: BTreeSet::new(),
            events,
        }
    }

    #[test]
    fn merge_is_idempotent() {
        let a = artifact(vec![ev("AAA", 5.0, 1), ev("BBB", 2.0, 2)]);
        let mut m1 = MasterDataset::new();
        m1.merge(&a).unwrap();
        let mut m2 = m1.clone();
        let second = m2.merge(&a).unwrap();
        assert_eq!(m1, m2);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 2);
    }

    #[test]
    fn merge_is_commutative() {
        let a = artifact(vec![ev("AAA", 5.0, 1)]);
        let b = artifact(vec![ev("BBB", 2.0, 2)]);

        let mut ab = MasterDataset::new();
        ab.merge(&a).unwrap();
        ab.merge(&b).unwrap();

        let mut ba = MasterDataset::new();
        ba.merge(&b).unwrap();
        ba.merge(&a).unwrap();

        assert_eq!(ab, ba);
    }

    #[test]
    fn conflicting_row_rejects_whole_artifact() {
        let mut master = MasterDataset::new();
        master.merge(&artifact(vec![ev("AAA", 5.0, 1)])).unwrap();

        let conflicting = artifact(vec![ev("BBB", 9.0, 2), ev("AAA", 6.0, 1)]);
        let err = master.merge(&conflicting).unwrap_err();
        assert!(matches!(err, PipelineError::MergeConsistency(_)));

        // Nothing from the rejected artifact was applied, not even BBB.
        assert_eq!(master.len(), 1);
        assert!(master
            .get(
                &IdentityKey::new("BBB", "USD"),
                Utc.with_ymd_and_hms(2025, 4, 14, 2, 0, 0).unwrap()
            )
            .is_none());
    }

    #[test]
    fn persist_load_round_trip_preserves_equality() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MasterStore::new(tmp.path().join("master.json"));
        let mut master = MasterDataset::new();
        master
            .merge(&artifact(vec![ev("AAA", 5.0, 1), ev("AAA", 7.0, 3)]))
            .unwrap();
        store.persist(&master).unwrap();
        assert_eq!(store.load().unwrap(), master);
    }

    #[test]
    fn latest_per_key_picks_newest_event() {
        let mut master = MasterDataset::new();
        master
            .merge(&artifact(vec![ev("AAA", 5.0, 1), ev("AAA", 7.0, 3)]))
            .unwrap();
        let latest = master.latest_per_key();
        assert_eq!(
            latest[&IdentityKey::new("AAA", "USD")].observed.fee_rate,
            Some(7.0)
        );
    }
}
