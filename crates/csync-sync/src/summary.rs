//! Run summary artifact persisted under `reports/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use csync_core::RunSummary;
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info, warn};

pub const SUMMARY_PREFIX: &str = "sync-summary-";

pub fn is_summary_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(SUMMARY_PREFIX) && n.ends_with(".json"))
}

async fn write_json_atomically(path: &Path, value: &serde_json::Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).context("serializing run summary")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &bytes)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {} -> {}", tmp.display(), path.display()))
}

async fn read_json(path: &Path) -> Result<serde_json::Value> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

/// Handle on this run's summary file.
#[derive(Debug, Clone)]
pub struct SummaryArtifact {
    path: PathBuf,
}

impl SummaryArtifact {
    /// Write the initial summary as `sync-summary-<YYYYmmdd_HHMMSS>.json`.
    pub async fn create(reports_dir: &Path, summary: &RunSummary, timezone: Tz) -> Result<Self> {
        fs::create_dir_all(reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;
        let stamp = summary
            .started_at
            .with_timezone(&timezone)
            .format("%Y%m%d_%H%M%S")
            .to_string();

        let mut path = reports_dir.join(format!("{SUMMARY_PREFIX}{stamp}.json"));
        let mut attempt = 1;
        while fs::try_exists(&path).await.unwrap_or(false) {
            path = reports_dir.join(format!("{SUMMARY_PREFIX}{stamp}-{attempt}.json"));
            attempt += 1;
        }

        let value = serde_json::to_value(summary).context("serializing run summary")?;
        write_json_atomically(&path, &value).await?;
        info!(path = %path.display(), "summary artifact created");
        Ok(Self { path })
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read-modify-write of a single top-level key.
    pub async fn update_key<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut doc = read_json(&self.path).await?;
        let value = serde_json::to_value(value).with_context(|| format!("serializing {key}"))?;
        match doc.as_object_mut() {
            Some(map) => {
                map.insert(key.to_string(), value);
            }
            None => anyhow::bail!("{} is not a json object", self.path.display()),
        }
        write_json_atomically(&self.path, &doc).await?;
        debug!(key, path = %self.path.display(), "summary key updated");
        Ok(())
    }

    pub async fn load(&self) -> Result<RunSummary> {
        let doc = read_json(&self.path).await?;
        serde_json::from_value(doc).with_context(|| format!("decoding {}", self.path.display()))
    }

    /// Stamp `ended_at` and `duration` and return the final summary.
    pub async fn finalize(&self, ended_at: DateTime<Utc>) -> Result<RunSummary> {
        let mut summary = self.load().await?;
        let duration = (ended_at - summary.started_at).num_milliseconds() as f64 / 1000.0;
        summary.ended_at = Some(ended_at);
        summary.duration = Some(duration);
        self.update_key("ended_at", &summary.ended_at).await?;
        self.update_key("duration", &summary.duration).await?;
        Ok(summary)
    }
}

async fn summary_files(reports_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(reports_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", reports_dir.display())),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("reading {}", reports_dir.display()))?
    {
        let path = entry.path();
        if is_summary_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Delete summaries of earlier runs that recorded no activity. Returns the count removed.
pub async fn prune_empty_summaries(reports_dir: &Path, keep: &Path) -> Result<usize> {
    let mut removed = 0;
    for path in summary_files(reports_dir).await? {
        if path == keep {
            continue;
        }
        let summary = match SummaryArtifact::open(&path).load().await {
            Ok(summary) => summary,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable summary left in place");
                continue;
            }
        };
        if summary.is_empty() {
            fs::remove_file(&path)
                .await
                .with_context(|| format!("removing {}", path.display()))?;
            removed += 1;
        }
    }
    if removed > 0 {
        info!(removed, "pruned empty summaries");
    }
    Ok(removed)
}

/// Most recently started summary in `reports_dir`.
pub async fn latest_summary(reports_dir: &Path) -> Result<Option<(PathBuf, RunSummary)>> {
    let mut latest: Option<(PathBuf, RunSummary)> = None;
    for path in summary_files(reports_dir).await? {
        let Ok(summary) = SummaryArtifact::open(&path).load().await else {
            continue;
        };
        let newer = latest
            .as_ref()
            .map_or(true, |(_, current)| summary.started_at >= current.started_at);
        if newer {
            latest = Some((path, summary));
        }
    }
    Ok(latest)
}
