//! Moves processed source files into dated `archived/` or `failed/` buckets.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use chrono_tz::Tz;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Archiver {
    archived_root: PathBuf,
    failed_root: PathBuf,
    dev_mode: bool,
    timezone: Tz,
}

impl Archiver {
    pub fn new(archived_root: PathBuf, failed_root: PathBuf, dev_mode: bool, timezone: Tz) -> Self {
        Self {
            archived_root,
            failed_root,
            dev_mode,
            timezone,
        }
    }

    fn dated(&self, root: &Path) -> PathBuf {
        let date = Utc::now().with_timezone(&self.timezone).format("%Y-%m-%d");
        root.join(date.to_string())
    }

    /// Move a successfully processed original; left in place in dev mode.
    pub async fn archive(&self, path: &Path) -> Result<Option<PathBuf>> {
        if self.dev_mode {
            info!(file = %path.display(), "dev mode, original left in place");
            return Ok(None);
        }
        let dest = move_into(path, &self.dated(&self.archived_root), &self.timezone).await?;
        info!(file = %path.display(), dest = %dest.display(), "archived source file");
        Ok(Some(dest))
    }

    pub async fn fail(&self, path: &Path) -> Result<PathBuf> {
        let dest = move_into(path, &self.dated(&self.failed_root), &self.timezone).await?;
        warn!(file = %path.display(), dest = %dest.display(), "moved source file to failed");
        Ok(dest)
    }
}

async fn move_into(path: &Path, dir: &Path, tz: &Tz) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("{} has no file name", path.display()))?;

    let mut dest = dir.join(file_name);
    if fs::try_exists(&dest).await.unwrap_or(false) {
        let stamp = Utc::now().with_timezone(tz).format("%H%M%S");
        dest = dir.join(format!("{stamp}-{}", file_name.to_string_lossy()));
    }

    if fs::rename(path, &dest).await.is_err() {
        fs::copy(path, &dest)
            .await
            .with_context(|| format!("copying {} to {}", path.display(), dest.display()))?;
        fs::remove_file(path)
            .await
            .with_context(|| format!("removing {}", path.display()))?;
    }
    Ok(dest)
}
