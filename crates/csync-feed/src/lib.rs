//! Feed file discovery, delimited parsing, ZIP extraction and column mapping.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use csync_core::{
    IndexedRow, MappedRecord, ParsedRow, SourceFileCandidate, EXTERNAL_ID_FIELD,
};
use encoding_rs::{Encoding, ISO_8859_15, WINDOWS_1252};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "csync-feed";

/// Extensions parsed as delimited data.
pub const DATA_EXTENSIONS: &[&str] = &["txt", "csv"];
/// Extensions shipped inside archives for reference only.
pub const REFERENCE_EXTENSIONS: &[&str] = &["accdb"];
pub const ARCHIVE_EXTENSION: &str = "zip";

const DELIMITER_CANDIDATES: [u8; 4] = [b',', b';', b'\t', b'|'];
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const HEADER_PREVIEW_FIELDS: usize = 12;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("archive {path} could not be read: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("invalid mapping tables: {0}")]
    Mapping(String),
    #[error("parsing mapping yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> FeedError + '_ {
    move |source| FeedError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

pub fn is_data_file(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| DATA_EXTENSIONS.contains(&ext.as_str()))
}

pub fn is_archive(path: &Path) -> bool {
    extension_of(path).as_deref() == Some(ARCHIVE_EXTENSION)
}

fn modified_at(meta: &fs::Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(DateTime::<Utc>::from)
}

pub fn format_timestamp(ts: DateTime<Utc>, tz: Tz) -> String {
    ts.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn trim_decimal(value: f64) -> String {
    let text = format!("{value:.2}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Human-readable size: `"1.5 MB"`, `"12.25 KB"`, `"512 B"`.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    if bytes >= MB {
        format!("{} MB", trim_decimal(bytes as f64 / MB as f64))
    } else if bytes >= KB {
        format!("{} KB", trim_decimal(bytes as f64 / KB as f64))
    } else {
        format!("{bytes} B")
    }
}

// Source file locator

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternRule {
    Prefix { prefix: String, extension: String },
    Suffix { suffix: String, extension: String },
    Infix { infix: String, extension: String },
}

impl PatternRule {
    /// Parse `PREFIX*.EXT`, `*SUFFIX.EXT` or `*INFIX*.EXT`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (name, extension) = raw.rsplit_once('.')?;
        if extension.is_empty() || !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        let extension = extension.to_ascii_uppercase();
        let name = name.to_ascii_uppercase();

        if name == "*" {
            return Some(Self::Prefix {
                prefix: String::new(),
                extension,
            });
        }
        match (name.strip_prefix('*'), name.strip_suffix('*')) {
            (Some(rest), Some(_)) => {
                let infix = rest.strip_suffix('*').unwrap_or(rest);
                (!infix.is_empty() && !infix.contains('*')).then(|| Self::Infix {
                    infix: infix.to_string(),
                    extension,
                })
            }
            (Some(suffix), None) => (!suffix.contains('*')).then(|| Self::Suffix {
                suffix: suffix.to_string(),
                extension,
            }),
            (None, Some(prefix)) => (!prefix.contains('*')).then(|| Self::Prefix {
                prefix: prefix.to_string(),
                extension,
            }),
            (None, None) => None,
        }
    }

    pub fn extension(&self) -> &str {
        match self {
            Self::Prefix { extension, .. }
            | Self::Suffix { extension, .. }
            | Self::Infix { extension, .. } => extension,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ExtensionRules {
    prefixes: Vec<String>,
    suffixes: Vec<String>,
    infixes: Vec<String>,
}

/// Compiled `;`-separated filename pattern specification.
#[derive(Debug, Default, Clone)]
pub struct PatternSet {
    by_extension: BTreeMap<String, ExtensionRules>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub rule: String,
    pub numeric_suffix: Option<String>,
}

impl PatternSet {
    pub fn parse(rules: &str) -> Self {
        let mut by_extension: BTreeMap<String, ExtensionRules> = BTreeMap::new();
        for raw in rules.split(';').map(str::trim).filter(|r| !r.is_empty()) {
            let Some(rule) = PatternRule::parse(raw) else {
                warn!(rule = raw, "ignoring unsupported file pattern rule");
                continue;
            };
            let entry = by_extension.entry(rule.extension().to_string()).or_default();
            match rule {
                PatternRule::Prefix { prefix, .. } => entry.prefixes.push(prefix),
                PatternRule::Suffix { suffix, .. } => entry.suffixes.push(suffix),
                PatternRule::Infix { infix, .. } => entry.infixes.push(infix),
            }
        }
        Self { by_extension }
    }

    pub fn is_empty(&self) -> bool {
        self.by_extension.is_empty()
    }

    /// Match a file name; extensions and name fragments compare ASCII case-insensitively.
    pub fn matches(&self, file_name: &str) -> Option<PatternMatch> {
        let path = Path::new(file_name);
        let ext = path.extension()?.to_str()?.to_ascii_uppercase();
        let stem = path.file_stem()?.to_str()?.to_ascii_uppercase();
        let rules = self.by_extension.get(&ext)?;

        if let Some(prefix) = rules.prefixes.iter().find(|p| stem.starts_with(p.as_str())) {
            let digits: String = stem[prefix.len()..]
                .chars()
                .take_while(char::is_ascii_digit)
                .collect();
            return Some(PatternMatch {
                rule: format!("{prefix}*.{ext}"),
                numeric_suffix: (!digits.is_empty()).then_some(digits),
            });
        }
        if let Some(suffix) = rules.suffixes.iter().find(|s| stem.ends_with(s.as_str())) {
            return Some(PatternMatch {
                rule: format!("*{suffix}.{ext}"),
                numeric_suffix: None,
            });
        }
        rules
            .infixes
            .iter()
            .find(|i| stem.contains(i.as_str()))
            .map(|infix| PatternMatch {
                rule: format!("*{infix}*.{ext}"),
                numeric_suffix: None,
            })
    }
}

/// Scans the source directory for the newest files matching a pattern specification.
#[derive(Debug, Clone, Copy)]
pub struct FileLocator {
    timezone: Tz,
}

impl FileLocator {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    /// Never fails: an unreadable directory is logged and yields no candidates.
    pub fn detect(&self, dir: &Path, pattern_rules: &str, limit: usize) -> Vec<SourceFileCandidate> {
        let patterns = PatternSet::parse(pattern_rules);
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "invalid source directory");
                return Vec::new();
            }
        };

        let mut candidates = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(matched) = patterns.matches(&file_name) else {
                continue;
            };
            let modified = modified_at(&meta).unwrap_or_else(|| DateTime::<Utc>::from(SystemTime::UNIX_EPOCH));
            candidates.push(SourceFileCandidate {
                path: entry.path(),
                byte_size: meta.len(),
                modified_at: modified,
                matched_rule: matched.rule,
                numeric_suffix: matched.numeric_suffix,
                size_display: format_size(meta.len()),
                mtime_display: modified
                    .with_timezone(&self.timezone)
                    .format("%Y-%m-%d %H:%M")
                    .to_string(),
            });
        }

        candidates.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
        candidates.truncate(limit);
        for candidate in &candidates {
            info!(
                "[source] found {} size={} mtime={}",
                candidate.path.display(),
                candidate.size_display,
                candidate.mtime_display
            );
        }
        candidates
    }
}

// Delimited parsing

pub fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes)
}

/// First line that is not blank after trimming, BOM removed.
pub fn first_non_empty_line(bytes: &[u8]) -> Option<&[u8]> {
    strip_bom(bytes)
        .split(|b| *b == b'\n')
        .map(|line| line.trim_ascii())
        .find(|line| !line.is_empty())
        .map(strip_bom)
}

/// Most frequent of `,` `;` tab `|`; comma on ties or when none occur.
pub fn detect_delimiter(line: &[u8]) -> u8 {
    let mut best = b',';
    let mut best_count = 0usize;
    for candidate in DELIMITER_CANDIDATES {
        let count = line.iter().filter(|b| **b == candidate).count();
        if count > best_count {
            best = candidate;
            best_count = count;
        }
    }
    best
}

pub fn count_lines(bytes: &[u8]) -> usize {
    if bytes.is_empty() {
        return 0;
    }
    let newlines = bytes.iter().filter(|b| **b == b'\n').count();
    if bytes.ends_with(b"\n") {
        newlines
    } else {
        newlines + 1
    }
}

fn fallback_encodings() -> [&'static Encoding; 2] {
    [WINDOWS_1252, ISO_8859_15]
}

/// Transliterate a cell to UTF-8: valid UTF-8 passes through, then the legacy
/// single-byte encodings are tried in order, lossy decoding as a last resort.
pub fn to_utf8(bytes: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.to_string();
    }
    for encoding in fallback_encodings() {
        let Some(decoded) = encoding.decode_without_bom_handling_and_without_replacement(bytes) else {
            continue;
        };
        let (encoded, _, had_errors) = encoding.encode(&decoded);
        if !had_errors && encoded.as_ref() == bytes {
            return decoded.into_owned();
        }
    }
    String::from_utf8_lossy(bytes).into_owned()
}

/// Header cell normalization: transliterate, trim, whitespace runs become `_`.
pub fn normalize_header(raw: &[u8]) -> String {
    to_utf8(raw).split_whitespace().collect::<Vec<_>>().join("_")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFile {
    pub path: PathBuf,
    pub delimiter: u8,
    pub headers: Vec<String>,
    pub rows: Vec<ParsedRow>,
    pub line_count: usize,
    pub byte_size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

impl ParsedFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn indexed_rows(&self) -> impl Iterator<Item = IndexedRow> + '_ {
        self.rows.iter().map(IndexedRow::from_parsed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedContent {
    pub delimiter: u8,
    pub headers: Vec<String>,
    pub rows: Vec<ParsedRow>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DelimitedParser {
    /// Emit the first non-empty line as a data row as well as using it for header names.
    pub header_row_is_data: bool,
}

fn is_blank_record(record: &csv::ByteRecord) -> bool {
    record.iter().all(|field| field.trim_ascii().is_empty())
}

impl DelimitedParser {
    pub fn new(header_row_is_data: bool) -> Self {
        Self { header_row_is_data }
    }

    pub fn parse(&self, path: &Path) -> Result<ParsedFile, FeedError> {
        let bytes = fs::read(path).map_err(io_err(path))?;
        let meta = fs::metadata(path).ok();
        let content = self.parse_bytes(&bytes);
        debug!(
            path = %path.display(),
            rows = content.rows.len(),
            headers = content.headers.len(),
            "parsed delimited file"
        );
        Ok(ParsedFile {
            path: path.to_path_buf(),
            delimiter: content.delimiter,
            headers: content.headers,
            rows: content.rows,
            line_count: count_lines(&bytes),
            byte_size: meta.as_ref().map_or(bytes.len() as u64, fs::Metadata::len),
            modified_at: meta.as_ref().and_then(modified_at),
        })
    }

    pub fn parse_bytes(&self, bytes: &[u8]) -> ParsedContent {
        let bytes = strip_bom(bytes);
        let Some(first) = first_non_empty_line(bytes) else {
            return ParsedContent {
                delimiter: b',',
                ..Default::default()
            };
        };
        let delimiter = detect_delimiter(first);

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes);

        let mut headers: Vec<String> = Vec::new();
        let mut rows = Vec::new();
        for (line_no, result) in reader.byte_records().enumerate() {
            let record = match result {
                Ok(record) => record,
                Err(err) => {
                    warn!(record = line_no, error = %err, "skipping unreadable row");
                    continue;
                }
            };
            if is_blank_record(&record) {
                continue;
            }
            if headers.is_empty() {
                headers = record
                    .iter()
                    .enumerate()
                    .map(|(idx, cell)| {
                        let name = normalize_header(cell);
                        if name.is_empty() {
                            format!("col_{idx}")
                        } else {
                            name
                        }
                    })
                    .collect();
                if !self.header_row_is_data {
                    continue;
                }
            }
            let cells = headers
                .iter()
                .enumerate()
                .map(|(idx, header)| (header.clone(), record.get(idx).map(to_utf8)))
                .collect();
            rows.push(ParsedRow::new(cells));
        }

        ParsedContent {
            delimiter,
            headers,
            rows,
        }
    }
}

/// `[index] => value` listing of the first non-empty line, for inspecting unknown layouts.
pub fn inspect_columns(path: &Path) -> Result<Vec<(usize, String)>, FeedError> {
    let bytes = fs::read(path).map_err(io_err(path))?;
    let Some(first) = first_non_empty_line(&bytes) else {
        return Ok(Vec::new());
    };
    Ok(split_line(first, detect_delimiter(first))
        .into_iter()
        .enumerate()
        .collect())
}

fn split_line(line: &[u8], delimiter: u8) -> Vec<String> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(line);
    reader
        .byte_records()
        .next()
        .and_then(Result::ok)
        .map(|record| record.iter().map(|c| to_utf8(c).trim().to_string()).collect())
        .unwrap_or_default()
}

// ZIP extraction

/// Data file metadata logged before parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub file_name: String,
    pub path: PathBuf,
    pub byte_size: u64,
    pub modified: String,
    pub line_count: usize,
    pub delimiter: u8,
    pub header_preview: Vec<String>,
}

pub fn scan_data_file(path: &Path, tz: Tz) -> Result<ScannedFile, FeedError> {
    let bytes = fs::read(path).map_err(io_err(path))?;
    let meta = fs::metadata(path).map_err(io_err(path))?;
    let first = first_non_empty_line(&bytes);
    let delimiter = first.map_or(b',', detect_delimiter);
    let mut header_preview = first.map(|l| split_line(l, delimiter)).unwrap_or_default();
    header_preview.truncate(HEADER_PREVIEW_FIELDS);

    Ok(ScannedFile {
        file_name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        path: path.to_path_buf(),
        byte_size: meta.len(),
        modified: modified_at(&meta)
            .map(|ts| format_timestamp(ts, tz))
            .unwrap_or_default(),
        line_count: count_lines(&bytes),
        delimiter,
        header_preview,
    })
}

/// Data and reference files directly inside `dir`, sorted by name.
pub fn list_feed_files(dir: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>), FeedError> {
    let mut data = Vec::new();
    let mut references = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir))?.filter_map(Result::ok) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match extension_of(&path) {
            Some(ext) if DATA_EXTENSIONS.contains(&ext.as_str()) => data.push(path),
            Some(ext) if REFERENCE_EXTENSIONS.contains(&ext.as_str()) => references.push(path),
            _ => {}
        }
    }
    data.sort();
    references.sort();
    Ok((data, references))
}

#[derive(Debug)]
pub struct ExtractedFile {
    pub scan: Option<ScannedFile>,
    pub path: PathBuf,
    pub parsed: Result<ParsedFile, FeedError>,
}

impl ExtractedFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct ExtractionOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub files: Vec<ExtractedFile>,
    pub skipped_references: Vec<PathBuf>,
}

/// Expands archives into per-run directories and parses their data files.
#[derive(Debug, Clone)]
pub struct ZipExtractor {
    extract_root: PathBuf,
    parser: DelimitedParser,
    timezone: Tz,
}

impl ZipExtractor {
    pub fn new(extract_root: impl Into<PathBuf>, parser: DelimitedParser, timezone: Tz) -> Self {
        Self {
            extract_root: extract_root.into(),
            parser,
            timezone,
        }
    }

    pub fn new_run_id() -> String {
        format!("chs_run_{}", Uuid::new_v4().simple())
    }

    /// Extract into a fresh run directory, then log and parse every data file.
    ///
    /// Errors only when the archive cannot be opened or fully extracted; per-file
    /// parse failures are carried in [`ExtractedFile::parsed`].
    pub fn extract_and_parse(&self, zip_path: &Path) -> Result<ExtractionOutcome, FeedError> {
        let run_id = Self::new_run_id();
        let run_dir = self.extract_root.join(&run_id);
        fs::create_dir_all(&run_dir).map_err(io_err(&run_dir))?;

        let file = File::open(zip_path).map_err(io_err(zip_path))?;
        let mut archive = zip::ZipArchive::new(file).map_err(|source| FeedError::Archive {
            path: zip_path.to_path_buf(),
            source,
        })?;
        archive.extract(&run_dir).map_err(|source| FeedError::Archive {
            path: zip_path.to_path_buf(),
            source,
        })?;
        info!(
            zip = %zip_path.display(),
            run_dir = %run_dir.display(),
            entries = archive.len(),
            "extracted archive"
        );

        let (data_files, skipped_references) = list_feed_files(&run_dir)?;
        info!(
            run_dir = %run_dir.display(),
            data_files = data_files.len(),
            "run directory scanned"
        );
        for reference in &skipped_references {
            info!(file = %reference.display(), "skipping reference file");
        }

        let files = data_files
            .into_iter()
            .map(|path| self.scan_and_parse(path))
            .collect();

        Ok(ExtractionOutcome {
            run_id,
            run_dir,
            files,
            skipped_references,
        })
    }

    fn scan_and_parse(&self, path: PathBuf) -> ExtractedFile {
        let scan = match scan_data_file(&path, self.timezone) {
            Ok(scan) => {
                let preview = if scan.header_preview.is_empty() {
                    "[none]".to_string()
                } else {
                    scan.header_preview.join(" | ")
                };
                info!(
                    "[scan] file={} path={} size={} modified={} lines={} header preview: {}",
                    scan.file_name,
                    scan.path.display(),
                    scan.byte_size,
                    scan.modified,
                    scan.line_count,
                    preview
                );
                Some(scan)
            }
            Err(err) => {
                warn!(file = %path.display(), error = %err, "could not scan extracted file");
                None
            }
        };
        let parsed = self.parser.parse(&path);
        ExtractedFile { scan, path, parsed }
    }
}

// Field mapping

/// Column index -> target field table for one source table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    pub table: String,
    pub columns: BTreeMap<u32, String>,
}

impl FieldMapping {
    pub fn target_fields(&self) -> BTreeSet<&str> {
        self.columns.values().map(String::as_str).collect()
    }
}

#[derive(Debug, Deserialize)]
struct MappingDocument {
    tables: BTreeMap<String, BTreeMap<u32, String>>,
}

/// Immutable set of mapping tables, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingTables {
    tables: BTreeMap<String, FieldMapping>,
}

const BUILTIN_MAPPINGS: &str = include_str!("../mappings.yaml");

/// Canonical table name for a feed file name (`inscriptions.txt` -> `INSCRIPTIONS.TXT`).
pub fn table_name_for(file_name: &str) -> String {
    file_name.trim().to_ascii_uppercase()
}

impl MappingTables {
    pub fn builtin() -> Result<Self, FeedError> {
        Self::from_yaml_str(BUILTIN_MAPPINGS)
    }

    pub fn from_path(path: &Path) -> Result<Self, FeedError> {
        let text = fs::read_to_string(path).map_err(io_err(path))?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, FeedError> {
        let doc: MappingDocument = serde_yaml::from_str(text)?;
        let mut tables = BTreeMap::new();
        for (name, columns) in doc.tables {
            if columns.get(&0).map(String::as_str) != Some(EXTERNAL_ID_FIELD) {
                return Err(FeedError::Mapping(format!(
                    "table {name}: column 0 must map to {EXTERNAL_ID_FIELD}"
                )));
            }
            let table = table_name_for(&name);
            tables.insert(
                table.clone(),
                FieldMapping {
                    table,
                    columns,
                },
            );
        }
        Ok(Self { tables })
    }

    pub fn get(&self, table: &str) -> Option<&FieldMapping> {
        self.tables.get(&table_name_for(table))
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

/// Translates positional rows into target meta fields.
#[derive(Debug, Clone)]
pub struct FieldMapper {
    tables: Arc<MappingTables>,
    reported_unknown: Arc<Mutex<BTreeSet<String>>>,
}

impl FieldMapper {
    pub fn new(tables: Arc<MappingTables>) -> Self {
        Self {
            tables,
            reported_unknown: Arc::default(),
        }
    }

    pub fn tables(&self) -> &MappingTables {
        &self.tables
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.get(table).is_some()
    }

    /// Every declared target field is present in the result; missing columns map to `""`.
    /// When several columns share a target, the highest index with a non-empty value wins.
    pub fn map(&self, row: &IndexedRow, table: &str) -> MappedRecord {
        let Some(mapping) = self.tables.get(table) else {
            if let Ok(mut reported) = self.reported_unknown.lock() {
                if reported.insert(table_name_for(table)) {
                    warn!(table, "no mapping found for table");
                }
            }
            return MappedRecord::default();
        };

        let mut fields: BTreeMap<String, String> = BTreeMap::new();
        for (index, target) in &mapping.columns {
            match row.get(*index) {
                Some(value) if !value.is_empty() => {
                    fields.insert(target.clone(), value.to_string());
                }
                Some(value) => {
                    fields.entry(target.clone()).or_insert_with(|| value.to_string());
                }
                None => {
                    fields.entry(target.clone()).or_default();
                }
            }
        }
        MappedRecord { fields }
    }

    pub fn map_parsed(&self, row: &ParsedRow, table: &str) -> MappedRecord {
        self.map(&IndexedRow::from_parsed(row), table)
    }
}
