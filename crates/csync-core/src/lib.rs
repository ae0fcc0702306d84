//! Core domain model for the Centris listing sync.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "csync-core";

/// External unique identifier of a listing (the MLS number).
pub const EXTERNAL_ID_FIELD: &str = "_centris_mls";
pub const TITLE_FIELD: &str = "_houzez_property_title";
pub const STATUS_FIELD: &str = "post_status";
pub const ADDRESS_FIELD: &str = "_houzez_property_address";
pub const CITY_FIELD: &str = "_houzez_property_city";
pub const IMAGE_URL_FIELD: &str = "_houzez_property_images";
pub const MEDIA_ORDER_FIELD: &str = "_houzez_media_order";

pub const SOURCE_FILE_META: &str = "_centris_source_file";
pub const SOURCE_ID_META: &str = "_centris_source_id";
pub const THUMBNAIL_META: &str = "_thumbnail_id";
pub const GALLERY_META: &str = "_property_image_gallery";

/// A file in the source directory that matched the configured pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFileCandidate {
    pub path: PathBuf,
    pub byte_size: u64,
    pub modified_at: DateTime<Utc>,
    pub matched_rule: String,
    pub numeric_suffix: Option<String>,
    pub size_display: String,
    pub mtime_display: String,
}

/// Summary-facing view of a detected source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedFile {
    pub path: String,
    pub size_mb: String,
    pub mtime: String,
}

impl From<&SourceFileCandidate> for DetectedFile {
    fn from(candidate: &SourceFileCandidate) -> Self {
        Self {
            path: candidate.path.display().to_string(),
            size_mb: candidate.size_display.clone(),
            mtime: candidate.mtime_display.clone(),
        }
    }
}

/// One data line of a delimited file, keyed by normalized header, in header order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedRow {
    cells: Vec<(String, Option<String>)>,
}

impl ParsedRow {
    pub fn new(cells: Vec<(String, Option<String>)>) -> Self {
        Self { cells }
    }

    pub fn get(&self, header: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(h, _)| h == header)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.cells.iter().map(|(h, v)| (h.as_str(), v.as_deref()))
    }

    /// Cell values in header order, for positional mapping.
    pub fn values(&self) -> impl Iterator<Item = Option<&str>> {
        self.cells.iter().map(|(_, v)| v.as_deref())
    }
}

/// Row keyed by zero-based column position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedRow {
    cells: BTreeMap<u32, Option<String>>,
}

impl IndexedRow {
    pub fn from_cells<I, S>(cells: I) -> Self
    where
        I: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        let cells = cells
            .into_iter()
            .enumerate()
            .map(|(idx, cell)| (idx as u32, cell.map(Into::into)))
            .collect();
        Self { cells }
    }

    pub fn from_parsed(row: &ParsedRow) -> Self {
        Self::from_cells(row.values())
    }

    pub fn insert(&mut self, index: u32, value: Option<String>) {
        self.cells.insert(index, value);
    }

    /// Present, non-null cell at `index`.
    pub fn get(&self, index: u32) -> Option<&str> {
        self.cells.get(&index).and_then(|v| v.as_deref())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Row translated into target meta-field names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedRecord {
    pub fields: BTreeMap<String, String>,
}

impl MappedRecord {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Field value, treating empty strings as absent.
    pub fn non_empty(&self, field: &str) -> Option<&str> {
        self.get(field).map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn external_id(&self) -> Option<&str> {
        self.non_empty(EXTERNAL_ID_FIELD)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PublicationStatus {
    Publish,
    Draft,
    Pending,
    Expired,
    Sold,
    Other(String),
}

impl PublicationStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Publish => "publish",
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Expired => "expired",
            Self::Sold => "sold",
            Self::Other(other) => other,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "publish" => Self::Publish,
            "draft" => Self::Draft,
            "pending" => Self::Pending,
            "expired" => Self::Expired,
            "sold" => Self::Sold,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_removal(&self) -> bool {
        matches!(self, Self::Expired | Self::Sold)
    }
}

impl Default for PublicationStatus {
    fn default() -> Self {
        Self::Publish
    }
}

impl fmt::Display for PublicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for PublicationStatus {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<PublicationStatus> for String {
    fn from(value: PublicationStatus) -> Self {
        value.as_str().to_string()
    }
}

/// Cached HTTP validators and content hash for one remote image URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoSignature {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_length: Option<String>,
    pub body_hash: Option<String>,
    pub attachment_id: Option<u64>,
    pub order: u32,
    pub alt: String,
}

/// Durable property entity owned by the catalog store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: u64,
    pub external_id: String,
    pub title: String,
    pub status: PublicationStatus,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub photo_signatures: BTreeMap<String, PhotoSignature>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Attributes for creating or updating a catalog record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDraft {
    pub external_id: String,
    pub title: String,
    pub status: PublicationStatus,
}

/// Reconciliation classification counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounters {
    pub created: u64,
    pub updated: u64,
    pub unpublished: u64,
    pub unchanged: u64,
    pub reactivated: u64,
    pub expired: u64,
}

impl ChangeCounters {
    /// True when anything besides `unchanged` moved.
    pub fn has_changes(&self) -> bool {
        self.created + self.updated + self.unpublished + self.reactivated + self.expired > 0
    }

    pub fn total_seen(&self) -> u64 {
        self.created + self.updated + self.unchanged
    }
}

/// Per-source-file photo counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoCounters {
    pub total_photos_processed: u64,
    pub skipped_unchanged: u64,
    pub downloaded_new: u64,
    pub downloaded_updated: u64,
    pub removed: u64,
    pub total_photos_failed: u64,
}

impl PhotoCounters {
    pub fn has_downloads(&self) -> bool {
        self.downloaded_new + self.downloaded_updated + self.removed > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub site_url: String,
    pub environment: String,
    pub plugin_version: String,
}

/// Consolidated report of one run, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Seconds between `started_at` and `ended_at`.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub system: SystemInfo,
    #[serde(default)]
    pub changes_tracked: ChangeCounters,
    #[serde(default)]
    pub photos_counter_file_bases: BTreeMap<String, PhotoCounters>,
    #[serde(default)]
    pub detected_files: Vec<DetectedFile>,
}

impl RunSummary {
    pub fn new(started_at: DateTime<Utc>, system: SystemInfo) -> Self {
        Self {
            started_at,
            ended_at: None,
            duration: None,
            system,
            changes_tracked: ChangeCounters::default(),
            photos_counter_file_bases: BTreeMap::new(),
            detected_files: Vec::new(),
        }
    }

    pub fn has_changes(&self) -> bool {
        self.changes_tracked.has_changes()
            || self
                .photos_counter_file_bases
                .values()
                .any(PhotoCounters::has_downloads)
    }

    /// Nothing was reconciled and no photo was touched.
    pub fn is_empty(&self) -> bool {
        self.changes_tracked == ChangeCounters::default()
            && self
                .photos_counter_file_bases
                .values()
                .all(|c| c.total_photos_processed == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parsing_is_case_insensitive_and_defaults_to_publish() {
        assert_eq!(PublicationStatus::parse("Draft"), PublicationStatus::Draft);
        assert_eq!(PublicationStatus::parse(""), PublicationStatus::Publish);
        assert_eq!(
            PublicationStatus::parse("archived"),
            PublicationStatus::Other("archived".into())
        );
        assert!(PublicationStatus::Sold.is_removal());
    }

    #[test]
    fn indexed_row_skips_null_cells() {
        let row = IndexedRow::from_cells(vec![Some("A1"), None, Some("x")]);
        assert_eq!(row.get(0), Some("A1"));
        assert_eq!(row.get(1), None);
        assert_eq!(row.get(2), Some("x"));
        assert_eq!(row.get(7), None);
    }

    #[test]
    fn parsed_row_keeps_header_order() {
        let row = ParsedRow::new(vec![
            ("B".into(), Some("2".into())),
            ("A".into(), Some("1".into())),
        ]);
        assert_eq!(row.values().collect::<Vec<_>>(), vec![Some("2"), Some("1")]);
        assert_eq!(row.get("A"), Some("1"));
    }

    #[test]
    fn summary_without_activity_is_empty() {
        let mut summary = RunSummary::new(Utc::now(), SystemInfo::default());
        assert!(summary.is_empty());
        summary.changes_tracked.unchanged = 3;
        assert!(!summary.is_empty());
        assert!(!summary.has_changes());
    }
}
