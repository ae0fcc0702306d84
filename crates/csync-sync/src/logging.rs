//! File log sinks: operational log plus a WARN+ error log, each size-capped.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const OPERATIONAL_LOG: &str = "centris-sync.log";
pub const ERROR_LOG: &str = "centris-sync-errors.log";
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Append-only log file truncated to empty once it would exceed `max_bytes`.
#[derive(Debug, Clone)]
pub struct CappedFile {
    path: PathBuf,
    max_bytes: u64,
    lock: Arc<Mutex<()>>,
}

impl CappedFile {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            lock: Arc::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn truncate(&self) -> io::Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))?;
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map(|_| ())
    }
}

impl Write for CappedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))?;
        let current = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        if current + buf.len() as u64 > self.max_bytes {
            file.set_len(0)?;
        }
        file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CappedFile {
    type Writer = CappedFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Operational and error log files under one directory.
#[derive(Debug, Clone)]
pub struct LogSinks {
    operational: CappedFile,
    errors: CappedFile,
}

impl LogSinks {
    pub fn new(logs_dir: &Path) -> Result<Self> {
        fs::create_dir_all(logs_dir).with_context(|| format!("creating {}", logs_dir.display()))?;
        Ok(Self {
            operational: CappedFile::new(logs_dir.join(OPERATIONAL_LOG), MAX_LOG_BYTES),
            errors: CappedFile::new(logs_dir.join(ERROR_LOG), MAX_LOG_BYTES),
        })
    }

    pub fn operational_path(&self) -> &Path {
        self.operational.path()
    }

    pub fn error_log_path(&self) -> &Path {
        self.errors.path()
    }

    /// Install the global subscriber. `RUST_LOG` overrides the default `info` filter.
    pub fn install(&self, with_stderr: bool) -> Result<()> {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let operational = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(self.operational.clone());
        let errors = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(self.errors.clone().with_max_level(Level::WARN));
        let stderr = with_stderr.then(|| tracing_subscriber::fmt::layer().with_writer(io::stderr));

        tracing_subscriber::registry()
            .with(filter)
            .with(operational)
            .with(errors)
            .with(stderr)
            .try_init()
            .context("installing tracing subscriber")
    }

    pub fn truncate_operational(&self) -> Result<()> {
        self.operational
            .truncate()
            .with_context(|| format!("truncating {}", self.operational.path().display()))
    }

    pub fn error_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<String> {
        error_window(self.errors.path(), start, end)
    }
}

fn leading_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let token = line.split_whitespace().next()?;
    DateTime::parse_from_rfc3339(token)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Error-log lines stamped within `[start, end]`; unstamped lines follow their predecessor.
pub fn error_window(path: &Path, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<String> {
    let Ok(text) = fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut inside = false;
    let mut lines = Vec::new();
    for line in text.lines() {
        if let Some(ts) = leading_timestamp(line) {
            inside = ts >= start && ts <= end;
        }
        if inside && !line.trim().is_empty() {
            lines.push(line.to_string());
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn capped_file_truncates_when_full() {
        let dir = tempdir().expect("tempdir");
        let mut file = CappedFile::new(dir.path().join("x.log"), 16);
        file.write_all(b"0123456789").expect("write");
        file.write_all(b"abcdefghij").expect("write");
        let text = std::fs::read_to_string(file.path()).expect("read");
        assert_eq!(text, "abcdefghij");
        file.truncate().expect("truncate");
        assert_eq!(std::fs::metadata(file.path()).expect("meta").len(), 0);
    }

    #[test]
    fn error_window_keeps_lines_between_bounds() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(ERROR_LOG);
        std::fs::write(
            &path,
            "2024-03-01T10:00:00.000000Z  WARN csync: before\n\
             2024-03-01T11:00:00.000000Z  WARN csync: during\n\
             \x20   continuation\n\
             2024-03-01T12:30:00.000000Z ERROR csync: after\n",
        )
        .expect("write");
        let start = DateTime::parse_from_rfc3339("2024-03-01T10:30:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let end = DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let lines = error_window(&path, start, end);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("during"));
        assert!(error_window(&dir.path().join("missing.log"), start, end).is_empty());
    }
}
