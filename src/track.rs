// src/track.rs
//! Change tracking: the per-key "last known value" map.
//!
//! For every incoming record, in snapshot-timestamp order, a `ChangeEvent`
//! is emitted only when the tracked fields differ from the last known value
//! for that identity key. Unchanged observations are suppressed; records
//! older than the key's last-known timestamp are rejected as a data-quality
//! anomaly and never alter the map.
//!
//! The map is a derived index: it can always be rebuilt from the master
//! dataset (plus any not-yet-merged events) via [`ChangeTracker::from_events`],
//! so the persisted copy is a cache, never the authority.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::state::{atomic_write_json, read_json_or_default};
use crate::types::{ChangeEvent, IdentityKey, Record};

#[derive(Debug, Default)]
pub struct ChangeTracker {
    last: BTreeMap<IdentityKey, ChangeEvent>,
}

#[derive(Debug, Default)]
pub struct TrackOutcome {
    pub events: Vec<ChangeEvent>,
    /// Records identical to the last known value (redundant snapshots).
    pub suppressed: usize,
    /// Records rejected for travelling backwards in time.
    pub out_of_order: usize,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the map by replaying events: for each key the event with the
    /// greatest `valid_from` wins. Feeding it the master dataset's rows plus
    /// pending (unmerged) events reconstructs the tracker exactly.
    pub fn from_events<I: IntoIterator<Item = ChangeEvent>>(events: I) -> Self {
        let mut tracker = Self::new();
        for ev in events {
            match tracker.last.get(&ev.key) {
                Some(cur) if cur.valid_from >= ev.valid_from => {}
                _ => {
                    tracker.last.insert(ev.key.clone(), ev);
                }
            }
        }
        tracker
    }

    pub fn load(path: &Path) -> Result<Self> {
        let events: Vec<ChangeEvent> = read_json_or_default(path)?;
        Ok(Self::from_events(events))
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        let events: Vec<&ChangeEvent> = self.last.values().collect();
        atomic_write_json(path, &events)
    }

    pub fn last_known(&self, key: &IdentityKey) -> Option<&ChangeEvent> {
        self.last.get(key)
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }

    /// Track one batch of records (typically one parsed snapshot).
    ///
    /// Duplicate (key, timestamp) pairs collapse first, later file position
    /// winning, so only one candidate per pair is ever compared.
    pub fn track(&mut self, records: Vec<Record>) -> TrackOutcome {
        let mut candidates: BTreeMap<(IdentityKey, DateTime<Utc>), Record> = BTreeMap::new();
        for rec in records {
            candidates.insert((rec.key.clone(), rec.observed_at), rec);
        }

        let mut out = TrackOutcome::default();
        for ((key, ts), rec) in candidates {
            match self.last.get(&key) {
                Some(prev) if ts < prev.valid_from => {
                    tracing::warn!(
                        key = %key,
                        observed_at = %ts,
                        last_known = %prev.valid_from,
                        "out-of-order record rejected"
                    );
                    out.out_of_order += 1;
                }
                Some(prev) if rec.observed.tracked_eq(&prev.observed) => {
                    out.suppressed += 1;
                }
                _ => {
                    let ev = ChangeEvent {
                        key: key.clone(),
                        observed: rec.observed,
                        valid_from: ts,
                    };
                    self.last.insert(key, ev.clone());
                    out.events.push(ev);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObservedFields;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 14, h, 0, 0).unwrap()
    }

    fn rec(sym: &str, fee: f64, at: DateTime<Utc>) -> Record {
        Record {
            key: IdentityKey::new(sym, "USD"),
            observed: ObservedFields {
                fee_rate: Some(fee),
                ..Default::default()
            },
            observed_at: at,
        }
    }

    #[test]
    fn identical_snapshot_is_suppressed() {
        let mut tracker = ChangeTracker::new();
        let first = tracker.track(vec![rec("AAA", 5.0, ts(1))]);
        assert_eq!(first.events.len(), 1);

        let second = tracker.track(vec![rec("AAA", 5.0, ts(2))]);
        assert!(second.events.is_empty());
        assert_eq!(second.suppressed, 1);

        // Last known keeps its original validity start.
        let last = tracker.last_known(&IdentityKey::new("AAA", "USD")).unwrap();
        assert_eq!(last.valid_from, ts(1));
    }

    #[test]
    fn changed_field_emits_event() {
        let mut tracker = ChangeTracker::new();
        tracker.track(vec![rec("AAA", 5.0, ts(1))]);
        let out = tracker.track(vec![rec("AAA", 7.0, ts(3))]);
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].valid_from, ts(3));
        assert_eq!(out.events[0].observed.fee_rate, Some(7.0));
    }

    #[test]
    fn out_of_order_record_is_rejected_and_map_untouched() {
        let mut tracker = ChangeTracker::new();
        tracker.track(vec![rec("AAA", 5.0, ts(5))]);
        let out = tracker.track(vec![rec("AAA", 9.0, ts(2))]);
        assert!(out.events.is_empty());
        assert_eq!(out.out_of_order, 1);
        let last = tracker.last_known(&IdentityKey::new("AAA", "USD")).unwrap();
        assert_eq!(last.observed.fee_rate, Some(5.0));
        assert_eq!(last.valid_from, ts(5));
    }

    #[test]
    fn same_timestamp_later_file_position_wins() {
        let mut tracker = ChangeTracker::new();
        let out = tracker.track(vec![rec("AAA", 5.0, ts(1)), rec("AAA", 6.0, ts(1))]);
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].observed.fee_rate, Some(6.0));
    }

    #[test]
    fn rebuild_from_events_keeps_latest_per_key() {
        let events = vec![
            ChangeEvent {
                key: IdentityKey::new("AAA", "USD"),
                observed: ObservedFields {
                    fee_rate: Some(5.0),
                    ..Default::default()
                },
                valid_from: ts(1),
            },
            ChangeEvent {
                key: IdentityKey::new("AAA", "USD"),
                observed: ObservedFields {
                    fee_rate: Some(7.0),
                    ..Default::default()
                },
                valid_from: ts(3),
            },
        ];
        let tracker = ChangeTracker::from_events(events);
        let last = tracker.last_known(&IdentityKey::new("AAA", "USD")).unwrap();
        assert_eq!(last.observed.fee_rate, Some(7.0));

        // A rebuilt tracker suppresses the value it already knows.
        let mut tracker = tracker;
        let out = tracker.track(vec![rec("AAA", 7.0, ts(4))]);
        assert_eq!(out.suppressed, 1);
    }

    #[test]
    fn persist_and_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("last_known.json");
        let mut tracker = ChangeTracker::new();
        tracker.track(vec![rec("AAA", 5.0, ts(1)), rec("BBB", 2.0, ts(1))]);
        tracker.persist(&path).unwrap();

        let reloaded = ChangeTracker::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(
            reloaded
                .last_known(&IdentityKey::new("BBB", "USD"))
                .unwrap()
                .observed
                .fee_rate,
            Some(2.0)
        );
    }
}
