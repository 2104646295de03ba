//! Advisory locks on top of the filesystem.
//!
//! [`FileLock`] is a short-lived mutex: exclusive-create with bounded,
//! linearly increasing retry. [`Lease`] is a non-blocking, TTL-bound claim
//! used to keep two workers off the same project.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Retry schedule for [`FileLock::acquire`].
#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub attempts: u32,
    /// Sleep after attempt `n` is `step * n`.
    pub step: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            attempts: 50,
            step: Duration::from_millis(10),
        }
    }
}

/// Held exclusive-create lock. Released explicitly or on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    released: bool,
}

impl FileLock {
    pub async fn acquire(path: impl Into<PathBuf>, opts: LockOptions) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        for attempt in 1..=opts.attempts {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    let stamp = format!("{} {}\n", std::process::id(), Utc::now().to_rfc3339());
                    file.write_all(stamp.as_bytes()).await?;
                    return Ok(Self {
                        path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    tokio::time::sleep(opts.step * attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::LockTimeout {
            path,
            attempts: opts.attempts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseFile {
    pid: u32,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// A TTL-bound claim on a key.
#[derive(Debug)]
pub struct Lease {
    path: PathBuf,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Try to claim `path` for `ttl`. Returns `None` when a live lease
    /// is held elsewhere; never waits.
    pub async fn try_acquire(path: impl Into<PathBuf>, ttl: Duration) -> Result<Option<Self>> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::Config(format!("lease ttl out of range: {e}")))?;
        let body = LeaseFile {
            pid: std::process::id(),
            acquired_at: now,
            expires_at: now + ttl,
        };

        if create_lease_file(&path, &body).await? {
            return Ok(Some(Self {
                path,
                expires_at: body.expires_at,
            }));
        }

        // Someone holds it; take over only if it has expired.
        let stale = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<LeaseFile>(&bytes) {
                Ok(existing) => existing.expires_at <= now,
                Err(_) => true,
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };
        if !stale {
            debug!(path = %path.display(), "lease held elsewhere");
            return Ok(None);
        }

        warn!(path = %path.display(), "taking over expired lease");
        let _ = tokio::fs::remove_file(&path).await;
        if create_lease_file(&path, &body).await? {
            Ok(Some(Self {
                path,
                expires_at: body.expires_at,
            }))
        } else {
            Ok(None)
        }
    }

    /// Push the expiry forward by `ttl`.
    pub async fn renew(&mut self, ttl: Duration) -> Result<()> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::Config(format!("lease ttl out of range: {e}")))?;
        let body = LeaseFile {
            pid: std::process::id(),
            acquired_at: now,
            expires_at: now + ttl,
        };
        super::write_json_atomic(&self.path, &body).await?;
        self.expires_at = body.expires_at;
        Ok(())
    }

    pub async fn release(self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn create_lease_file(path: &Path, body: &LeaseFile) -> Result<bool> {
    match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(mut file) => {
            file.write_all(&serde_json::to_vec(body)?).await?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_times_out_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("writer.lock");
        let held = FileLock::acquire(&path, LockOptions::default()).await.unwrap();

        let quick = LockOptions {
            attempts: 3,
            step: Duration::from_millis(1),
        };
        let err = FileLock::acquire(&path, quick).await.unwrap_err();
        assert!(matches!(err, Error::LockTimeout { attempts: 3, .. }));

        held.release().await.unwrap();
        let again = FileLock::acquire(&path, quick).await.unwrap();
        drop(again);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn live_lease_blocks_and_expired_lease_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks").join("p1.json");

        let lease = Lease::try_acquire(&path, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert!(
            Lease::try_acquire(&path, Duration::from_secs(30))
                .await
                .unwrap()
                .is_none()
        );
        lease.release().await.unwrap();

        let expired = LeaseFile {
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::seconds(60),
            expires_at: Utc::now() - chrono::Duration::seconds(30),
        };
        tokio::fs::write(&path, serde_json::to_vec(&expired).unwrap())
            .await
            .unwrap();
        assert!(
            Lease::try_acquire(&path, Duration::from_secs(30))
                .await
                .unwrap()
                .is_some()
        );
    }
}
