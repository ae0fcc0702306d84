//! Post-run summary reports and their delivery policy.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use csync_core::RunSummary;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendMode {
    Disabled,
    #[default]
    Always,
    Changes,
    Error,
}

impl FromStr for SendMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" | "none" => Ok(Self::Disabled),
            "always" => Ok(Self::Always),
            "changes" => Ok(Self::Changes),
            "error" | "errors" => Ok(Self::Error),
            other => Err(format!("unknown send mode `{other}`")),
        }
    }
}

impl SendMode {
    pub fn should_send(&self, summary: &RunSummary, error_lines: &[String]) -> bool {
        match self {
            Self::Disabled => false,
            Self::Always => true,
            Self::Changes => summary.has_changes(),
            Self::Error => {
                !error_lines.is_empty()
                    || summary
                        .photos_counter_file_bases
                        .values()
                        .any(|c| c.total_photos_failed > 0)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub recipients: Vec<String>,
    pub body: String,
}

/// Delivery of a composed report; transport lives outside this crate.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Markdown rendering of a run summary and its error window.
pub fn render_summary_markdown(summary: &RunSummary, error_lines: &[String]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Centris Sync Summary\n");
    let _ = writeln!(out, "- Started: {}", summary.started_at.to_rfc3339());
    let ended = summary
        .ended_at
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_else(|| "in progress".to_string());
    let _ = writeln!(out, "- Ended: {ended}");
    if let Some(duration) = summary.duration {
        let _ = writeln!(out, "- Duration: {duration:.2}s");
    }
    if !summary.system.site_url.is_empty() {
        let _ = writeln!(out, "- Site: {}", summary.system.site_url);
    }
    if !summary.system.environment.is_empty() {
        let _ = writeln!(out, "- Environment: {}", summary.system.environment);
    }
    let _ = writeln!(out, "- Version: {}", summary.system.plugin_version);

    let c = &summary.changes_tracked;
    let _ = writeln!(out, "\n## Listings\n");
    for (label, value) in [
        ("created", c.created),
        ("updated", c.updated),
        ("unchanged", c.unchanged),
        ("reactivated", c.reactivated),
        ("unpublished", c.unpublished),
        ("expired", c.expired),
    ] {
        let _ = writeln!(out, "- {label}: {value}");
    }

    let _ = writeln!(out, "\n## Photos\n");
    if summary.photos_counter_file_bases.is_empty() {
        let _ = writeln!(out, "_no photo rows processed_");
    }
    for (file, p) in &summary.photos_counter_file_bases {
        let _ = writeln!(
            out,
            "- `{file}`: processed {}, unchanged {}, new {}, updated {}, removed {}, failed {}",
            p.total_photos_processed,
            p.skipped_unchanged,
            p.downloaded_new,
            p.downloaded_updated,
            p.removed,
            p.total_photos_failed
        );
    }

    let _ = writeln!(out, "\n## Detected Files\n");
    if summary.detected_files.is_empty() {
        let _ = writeln!(out, "_none_");
    }
    for file in &summary.detected_files {
        let _ = writeln!(out, "- `{}` ({}, {})", file.path, file.size_mb, file.mtime);
    }

    if !error_lines.is_empty() {
        let _ = writeln!(out, "\n## Errors\n\n```");
        for line in error_lines {
            let _ = writeln!(out, "{line}");
        }
        let _ = writeln!(out, "```");
    }
    out
}

pub fn compose_report(
    subject_prefix: &str,
    recipients: &[String],
    summary: &RunSummary,
    error_lines: &[String],
) -> Notification {
    Notification {
        subject: format!("{} Sync Summary", subject_prefix.trim()).trim().to_string(),
        recipients: recipients.to_vec(),
        body: render_summary_markdown(summary, error_lines),
    }
}

/// Writes each report as a markdown file for an external mailer to pick up.
#[derive(Debug, Clone)]
pub struct OutboxNotifier {
    dir: PathBuf,
}

impl OutboxNotifier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.dir.join(format!(
            "{}-{}.md",
            Utc::now().format("%Y%m%d_%H%M%S"),
            uuid::Uuid::new_v4().simple()
        ));
        let mut doc = format!("Subject: {}\n", notification.subject);
        if !notification.recipients.is_empty() {
            let _ = writeln!(doc, "To: {}", notification.recipients.join(", "));
        }
        doc.push('\n');
        doc.push_str(&notification.body);
        fs::write(&path, doc)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "summary report queued");
        Ok(())
    }
}
