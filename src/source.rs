// src/source.rs
//! Remote snapshot sources.
//!
//! The remote side is only a file-listing protocol (path/size/mtime) plus a
//! file-read protocol (raw bytes), both polled. Two implementations:
//! `FsSource` for a local or mounted mirror, and `HttpSource` for a server
//! exposing a `manifest.json` listing plus per-file GETs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::types::RemoteEntry;

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Enumerate all files under the remote root, recursively.
    async fn list(&self) -> Result<Vec<RemoteEntry>>;

    /// Read the raw bytes of one remote file.
    async fn fetch(&self, path: &str) -> Result<Vec<u8>>;

    fn name(&self) -> &'static str;
}

// ── Filesystem mirror ───────────────────────────────────────────────

pub struct FsSource {
    root: PathBuf,
}

impl FsSource {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn walk(&self, dir: &Path, out: &mut Vec<RemoteEntry>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let meta = entry.metadata()?;
            if meta.is_dir() {
                self.walk(&path, out)?;
            } else if meta.is_file() {
                let rel = path
                    .strip_prefix(&self.root)
                    .unwrap_or(&path)
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let modified = meta
                    .modified()
                    .ok()
                    .map(|t| DateTime::<Utc>::from(t));
                out.push(RemoteEntry {
                    path: rel,
                    size: meta.len(),
                    modified,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotSource for FsSource {
    async fn list(&self) -> Result<Vec<RemoteEntry>> {
        let mut out = Vec::new();
        self.walk(&self.root, &mut out)
            .map_err(|e| PipelineError::transport(format!("listing {}: {e}", self.root.display())))?;
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.root.join(path))
            .await
            .map_err(|e| PipelineError::transport(format!("reading {path}: {e}")))
    }

    fn name(&self) -> &'static str {
        "fs"
    }
}

// ── HTTP listing + per-file GET ─────────────────────────────────────

pub struct HttpSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new<S: Into<String>>(base_url: S) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl SnapshotSource for HttpSource {
    async fn list(&self) -> Result<Vec<RemoteEntry>> {
        let url = self.url_for("manifest.json");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PipelineError::transport(format!("GET {url}: {e}")))?
            .error_for_status()
            .map_err(|e| PipelineError::transport(format!("GET {url}: {e}")))?;
        resp.json::<Vec<RemoteEntry>>()
            .await
            .map_err(|e| PipelineError::transport(format!("decoding {url}: {e}")))
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        let url = self.url_for(path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PipelineError::transport(format!("GET {url}: {e}")))?
            .error_for_status()
            .map_err(|e| PipelineError::transport(format!("GET {url}: {e}")))?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| PipelineError::transport(format!("reading {url}: {e}")))?;
        Ok(bytes.to_vec())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
