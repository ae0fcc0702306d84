//! Cross-invocation run lock backed by a marker file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

pub const LOCK_FILE_NAME: &str = "chs_run.lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockMarker {
    locked_at: DateTime<Utc>,
    pid: u32,
    tz: String,
}

#[derive(Debug, Clone)]
pub struct RunLock {
    path: PathBuf,
    ttl: Duration,
    timezone: Tz,
}

impl RunLock {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration, timezone: Tz) -> Self {
        Self {
            path: path.into(),
            ttl,
            timezone,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Age of the current marker, `None` when no marker exists.
    pub async fn age(&self) -> Option<chrono::Duration> {
        let locked_at = match fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice::<LockMarker>(&bytes) {
                Ok(marker) => marker.locked_at,
                Err(_) => fs::metadata(&self.path)
                    .await
                    .ok()?
                    .modified()
                    .ok()
                    .map(DateTime::<Utc>::from)?,
            },
            Err(_) => return None,
        };
        Some(Utc::now() - locked_at)
    }

    /// Returns `false` when a fresh marker is held by another run. Stale markers are removed.
    pub async fn acquire(&self) -> Result<bool> {
        if let Some(age) = self.age().await {
            let stale = age.to_std().is_ok_and(|age| age > self.ttl);
            if !stale {
                info!(
                    lock = %self.path.display(),
                    age_secs = age.num_seconds(),
                    "run lock held, skipping"
                );
                return Ok(false);
            }
            warn!(
                lock = %self.path.display(),
                age_secs = age.num_seconds(),
                "removing stale run lock"
            );
            match fs::remove_file(&self.path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("removing stale lock {}", self.path.display()))
                }
            }
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                info!(lock = %self.path.display(), "run lock taken concurrently, skipping");
                return Ok(false);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("creating lock {}", self.path.display()))
            }
        };

        let marker = LockMarker {
            locked_at: Utc::now(),
            pid: std::process::id(),
            tz: self.timezone.name().to_string(),
        };
        let bytes = serde_json::to_vec(&marker).context("serializing lock marker")?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing lock {}", self.path.display()))?;
        file.flush().await.ok();
        info!(lock = %self.path.display(), "run lock acquired");
        Ok(true)
    }

    /// Acquire and wrap in a guard that releases on drop.
    pub async fn try_guard(&self) -> Result<Option<RunLockGuard>> {
        Ok(self.acquire().await?.then(|| RunLockGuard {
            path: self.path.clone(),
            released: false,
        }))
    }

    /// Idempotent; a missing marker is not an error.
    pub async fn release(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(lock = %self.path.display(), "run lock released");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(lock = %self.path.display(), "run lock already released");
                Ok(())
            }
            Err(err) => Err(err).with_context(|| format!("removing lock {}", self.path.display())),
        }
    }
}

/// Held for the duration of a run.
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
    released: bool,
}

impl RunLockGuard {
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(lock = %self.path.display(), "run lock released");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing lock {}", self.path.display())),
        }
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = std::fs::remove_file(&self.path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(lock = %self.path.display(), error = %err, "failed to release run lock");
                }
            }
        }
    }
}
