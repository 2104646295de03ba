//! Durable record store.
//!
//! Filesystem-backed JSON documents rooted at a data directory. Every
//! write lands in a temp file first and is renamed into place, so readers
//! never observe a partially written record. Entity writes go through
//! [`Record::validate`] before touching disk.
//!
//! Layout:
//!
//! ```text
//! <root>/projects/<projectId>/project.json
//! <root>/projects/<projectId>/{jobs,specs,assets,automation-rules,automation-runs,...}/<id>.json
//! <root>/projects/<projectId>/events/{events.jsonl,seq.json,idempotency-index.json,writer.lock}
//! <root>/shared/loras/<id>.json
//! <root>/runtime/{worker-heartbeat.json,worker-locks/<projectId>.json}
//! ```

pub mod lock;
pub mod schema;

pub use lock::{FileLock, Lease, LockOptions};
pub use schema::Record;

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;

/// Handle to the data root. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // -----------------------------------------------------------------------
    // Paths
    // -----------------------------------------------------------------------

    pub fn projects_dir(&self) -> PathBuf {
        self.root.join("projects")
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.projects_dir().join(project_id)
    }

    /// `<root>/projects/<projectId>/<collection>`
    pub fn collection_dir(&self, project_id: &str, collection: &str) -> PathBuf {
        self.project_dir(project_id).join(collection)
    }

    /// `<root>/projects/<projectId>/<collection>/<id>.json`
    pub fn record_path(&self, project_id: &str, collection: &str, id: &str) -> PathBuf {
        self.collection_dir(project_id, collection)
            .join(format!("{id}.json"))
    }

    pub fn shared_dir(&self, collection: &str) -> PathBuf {
        self.root.join("shared").join(collection)
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.root.join("runtime")
    }

    /// Absolute path for a path stored relative to the data root.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative.trim_start_matches('/'))
    }

    /// Inverse of [`Store::resolve`], with forward slashes.
    pub fn relativize(&self, absolute: &Path) -> String {
        absolute
            .strip_prefix(&self.root)
            .unwrap_or(absolute)
            .to_string_lossy()
            .replace('\\', "/")
    }

    // -----------------------------------------------------------------------
    // Documents
    // -----------------------------------------------------------------------

    /// Read a JSON document. A missing file is `Ok(None)`.
    pub async fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Validate and atomically replace a record.
    pub async fn write<T: Record>(&self, path: &Path, record: &T) -> Result<()> {
        record.validate()?;
        write_json_atomic(path, record).await
    }

    /// Read every `*.json` document in a directory.
    ///
    /// A missing directory is an empty list. Documents that fail to parse
    /// are skipped with a warning rather than failing the whole listing.
    pub async fn list<T: DeserializeOwned>(&self, dir: &Path) -> Result<Vec<T>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") && entry.file_type().await?.is_file()
            {
                paths.push(path);
            }
        }
        paths.sort();

        let mut items = Vec::with_capacity(paths.len());
        for path in paths {
            match self.read::<T>(&path).await {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        Ok(items)
    }

    /// Delete a document. Returns whether it existed.
    pub async fn remove(&self, path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of every project directory under `projects/`.
    pub async fn list_project_ids(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(self.projects_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Serialize `value` to a sibling temp file and rename it over `path`.
///
/// Used directly for auxiliary state (sequence counters, leases) that has
/// no schema of its own.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut body = serde_json::to_vec_pretty(value)?;
    body.push(b'\n');

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, &body).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
