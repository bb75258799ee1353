// src/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry from the remote listing. Ephemeral: used only to decide
/// "already downloaded vs. new" and recorded in the fetch manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Composite identity of a tracked loan line across snapshots.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    pub symbol: String,   // e.g. "AAPL"
    pub currency: String, // e.g. "USD"
}

impl IdentityKey {
    pub fn new<S: Into<String>, C: Into<String>>(symbol: S, currency: C) -> Self {
        Self {
            symbol: symbol.into(),
            currency: currency.into(),
        }
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.symbol, self.currency)
    }
}

/// Fields observed for a key in one snapshot. Numeric fields that failed to
/// parse are `None`, never zero, so missing data cannot fake a delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedFields {
    pub fee_rate: Option<f64>,
    pub rebate_rate: Option<f64>,
    pub available: Option<f64>,
    pub name: Option<String>,
    pub country: Option<String>,
}

impl ObservedFields {
    /// Change detection looks only at the rate/availability columns; the
    /// free-text name and the country tag never trigger a new event.
    pub fn tracked_eq(&self, other: &Self) -> bool {
        self.fee_rate == other.fee_rate
            && self.rebate_rate == other.rebate_rate
            && self.available == other.available
    }
}

/// One parsed observation from a raw snapshot line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: IdentityKey,
    pub observed: ObservedFields,
    pub observed_at: DateTime<Utc>,
}

/// A real transition in observed values for a key, valid from `valid_from`
/// until superseded by the next event for the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub key: IdentityKey,
    pub observed: ObservedFields,
    pub valid_from: DateTime<Utc>,
}

/// Deterministic staging identifier for a downloaded snapshot, derived from
/// its remote path so re-fetching overwrites instead of duplicating.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn from_remote_path(path: &str) -> Self {
        let trimmed = path.trim_start_matches('/');
        Self(trimmed.replace('/', "__"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
