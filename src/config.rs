// src/config.rs
//! Pipeline configuration, loaded from TOML with env fallbacks:
//! 1) $STOCK_LOAN_CONFIG_PATH
//! 2) config/pipeline.toml
//! 3) built-in defaults (filesystem source rooted at `mirror/`)

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const ENV_PATH: &str = "STOCK_LOAN_CONFIG_PATH";

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Root directory for all pipeline-owned storage (staging, state,
    /// events, artifacts, master, archive).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    /// Optional endpoint for best-effort run-metadata reporting.
    #[serde(default)]
    pub metadata_endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// A local or mounted mirror of the remote tree.
    Fs { root: PathBuf },
    /// An HTTP server exposing `manifest.json` plus per-file GETs.
    Http { base_url: String },
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::Fs {
            root: PathBuf::from("mirror"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempts per file before it is skipped and reported.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            timeout_secs: default_timeout_secs(),
            attempts: default_attempts(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArchiveConfig {
    /// Delete raw snapshots after merge instead of relocating them.
    #[serde(default)]
    pub delete: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_concurrency() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_attempts() -> u32 {
    3
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            source: SourceConfig::default(),
            fetch: FetchConfig::default(),
            archive: ArchiveConfig::default(),
            metadata_endpoint: None,
        }
    }
}

impl PipelineConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Env var first, then the conventional path, then defaults.
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("STOCK_LOAN_CONFIG_PATH points to non-existent path"));
        }
        let conventional = PathBuf::from("config/pipeline.toml");
        if conventional.exists() {
            return Self::load_from(&conventional);
        }
        Ok(Self::default())
    }

    // Storage layout, all under data_dir.

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn events_dir(&self) -> PathBuf {
        self.data_dir.join("events")
    }

    pub fn compacted_dir(&self) -> PathBuf {
        self.data_dir.join("compacted")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.data_dir.join("archive")
    }

    pub fn master_path(&self) -> PathBuf {
        self.data_dir.join("master.json")
    }

    pub fn fetch_manifest_path(&self) -> PathBuf {
        self.state_dir().join("fetch_manifest.json")
    }

    pub fn snapshot_state_path(&self) -> PathBuf {
        self.state_dir().join("snapshots.json")
    }

    pub fn last_known_path(&self) -> PathBuf {
        self.state_dir().join("last_known.json")
    }

    pub fn archive_manifest_path(&self) -> PathBuf {
        self.state_dir().join("archive_manifest.json")
    }
}
