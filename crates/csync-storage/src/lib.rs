//! Media artifact storage, catalog store and HTTP fetch utilities for the listing sync.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csync_core::{CatalogRecord, PhotoSignature, RecordDraft};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "csync-storage";

/// Blob written by [`ArtifactStore::put`], addressed by its sha256 digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub digest: String,
    pub relative_path: PathBuf,
    pub reused: bool,
}

/// Hash-addressed media layout: `<YYYYmmdd>/<owner>/<sha256>.<ext>` under a root directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Content hash in the `sha256:<hex>` form stored on photo signatures.
    pub fn body_hash(bytes: &[u8]) -> String {
        format!("sha256:{}", Self::sha256_hex(bytes))
    }

    pub fn path_of(&self, blob: &StoredBlob) -> PathBuf {
        self.root.join(&blob.relative_path)
    }

    /// Writes `bytes` once per digest; an existing blob is reused untouched.
    pub async fn put(
        &self,
        day: DateTime<Utc>,
        owner: &str,
        extension: &str,
        bytes: &[u8],
    ) -> std::io::Result<StoredBlob> {
        let digest = Self::sha256_hex(bytes);
        let ext = match extension.trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        let relative_path = PathBuf::from(day.format("%Y%m%d").to_string())
            .join(owner)
            .join(format!("{digest}.{ext}"));
        let path = self.root.join(&relative_path);
        let reused = fs::try_exists(&path).await?;
        if !reused {
            write_atomically(&path, bytes).await?;
        }
        Ok(StoredBlob {
            digest,
            relative_path,
            reused,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub head_timeout: Duration,
    pub download_timeout: Duration,
    pub max_redirects: usize,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            head_timeout: Duration::from_secs(10),
            download_timeout: Duration::from_secs(30),
            max_redirects: 3,
            user_agent: None,
        }
    }
}

/// Validators sent with a conditional HEAD request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionalHeaders {
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
}

impl ConditionalHeaders {
    pub fn from_signature(signature: Option<&PhotoSignature>) -> Self {
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
        match signature {
            Some(sig) => Self {
                if_none_match: non_empty(&sig.etag),
                if_modified_since: non_empty(&sig.last_modified),
            },
            None => Self::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadResponse {
    pub status: u16,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_length: Option<String>,
}

impl HeadResponse {
    pub fn is_not_modified(&self) -> bool {
        self.status == StatusCode::NOT_MODIFIED.as_u16()
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("transport failure for {url}: {message}")]
    Transport { url: String, message: String },
}

/// Remote image source used by the photo sync.
#[async_trait]
pub trait RemoteMedia: Send + Sync {
    async fn head(&self, url: &str, conditional: &ConditionalHeaders) -> Result<HeadResponse, FetchError>;

    /// Full body download; anything but `200 OK` is an error.
    async fn download(&self, url: &str) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    head_timeout: Duration,
    download_timeout: Duration,
}

fn header_string(headers: &reqwest::header::HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Connection and timeout failures are transport problems; the rest stay request errors.
fn request_error(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_connect() || err.is_timeout() {
        FetchError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        }
    } else {
        FetchError::Request(err)
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects));

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            head_timeout: config.head_timeout,
            download_timeout: config.download_timeout,
        })
    }
}

#[async_trait]
impl RemoteMedia for HttpFetcher {
    async fn head(&self, url: &str, conditional: &ConditionalHeaders) -> Result<HeadResponse, FetchError> {
        let mut request = self.client.head(url).timeout(self.head_timeout);
        if let Some(etag) = &conditional.if_none_match {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(since) = &conditional.if_modified_since {
            request = request.header(IF_MODIFIED_SINCE, since);
        }

        let resp = request
            .send()
            .instrument(info_span!("http_head", url))
            .await
            .map_err(|err| request_error(url, err))?;
        let headers = resp.headers();
        Ok(HeadResponse {
            status: resp.status().as_u16(),
            etag: header_string(headers, ETAG),
            last_modified: header_string(headers, LAST_MODIFIED),
            content_length: header_string(headers, CONTENT_LENGTH),
        })
    }

    async fn download(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.download_body(url)
            .instrument(info_span!("http_download", url))
            .await
    }
}

impl HttpFetcher {
    async fn download_body(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self
            .client
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .await
            .map_err(|err| request_error(url, err))?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if status != StatusCode::OK {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let content_type = header_string(resp.headers(), CONTENT_TYPE);
        let body = resp
            .bytes()
            .await
            .map_err(|err| request_error(&final_url, err))?
            .to_vec();
        Ok(FetchedResponse {
            status: status.as_u16(),
            final_url,
            content_type,
            body,
        })
    }
}


#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog record {0} not found")]
    NotFound(u64),
    #[error("catalog io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("catalog document {path} is invalid: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Record store keyed by the external listing identifier.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<CatalogRecord>, CatalogError>;
    async fn get(&self, id: u64) -> Result<Option<CatalogRecord>, CatalogError>;
    async fn create(&self, draft: &RecordDraft) -> Result<u64, CatalogError>;
    async fn update(&self, id: u64, draft: &RecordDraft) -> Result<(), CatalogError>;
    async fn set_meta(&self, id: u64, key: &str, value: &str) -> Result<(), CatalogError>;
    async fn photo_signatures(&self, id: u64) -> Result<BTreeMap<String, PhotoSignature>, CatalogError>;
    async fn set_photo_signatures(
        &self,
        id: u64,
        signatures: BTreeMap<String, PhotoSignature>,
    ) -> Result<(), CatalogError>;

    /// Persist buffered writes.
    async fn flush(&self) -> Result<(), CatalogError> {
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogDocument {
    next_id: u64,
    records: BTreeMap<u64, CatalogRecord>,
    #[serde(skip)]
    by_external_id: HashMap<String, u64>,
}

impl CatalogDocument {
    fn reindex(&mut self) {
        self.by_external_id = self
            .records
            .values()
            .map(|r| (r.external_id.clone(), r.id))
            .collect();
    }

    fn record_mut(&mut self, id: u64) -> Result<&mut CatalogRecord, CatalogError> {
        self.records.get_mut(&id).ok_or(CatalogError::NotFound(id))
    }
}

/// Catalog kept in memory and persisted as one JSON document on `flush`.
#[derive(Debug)]
pub struct JsonCatalogStore {
    path: Option<PathBuf>,
    doc: Mutex<CatalogDocument>,
}

impl JsonCatalogStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            doc: Mutex::new(CatalogDocument {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let path = path.into();
        let mut doc = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<CatalogDocument>(&bytes).map_err(|source| {
                CatalogError::Json {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => CatalogDocument::default(),
            Err(source) => return Err(CatalogError::Io { path, source }),
        };
        doc.next_id = doc.next_id.max(doc.records.keys().max().map_or(1, |m| m + 1));
        doc.reindex();
        info!(path = %path.display(), records = doc.records.len(), "catalog loaded");
        Ok(Self {
            path: Some(path),
            doc: Mutex::new(doc),
        })
    }

    pub async fn len(&self) -> usize {
        self.doc.lock().await.records.len()
    }

    pub async fn records(&self) -> Vec<CatalogRecord> {
        self.doc.lock().await.records.values().cloned().collect()
    }
}

#[async_trait]
impl CatalogStore for JsonCatalogStore {
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<CatalogRecord>, CatalogError> {
        let doc = self.doc.lock().await;
        Ok(doc
            .by_external_id
            .get(external_id)
            .and_then(|id| doc.records.get(id))
            .cloned())
    }

    async fn get(&self, id: u64) -> Result<Option<CatalogRecord>, CatalogError> {
        Ok(self.doc.lock().await.records.get(&id).cloned())
    }

    async fn create(&self, draft: &RecordDraft) -> Result<u64, CatalogError> {
        let mut doc = self.doc.lock().await;
        let id = doc.next_id.max(1);
        doc.next_id = id + 1;
        let now = Utc::now();
        doc.records.insert(
            id,
            CatalogRecord {
                id,
                external_id: draft.external_id.clone(),
                title: draft.title.clone(),
                status: draft.status.clone(),
                meta: BTreeMap::new(),
                photo_signatures: BTreeMap::new(),
                created_at: now,
                updated_at: now,
            },
        );
        doc.by_external_id.insert(draft.external_id.clone(), id);
        Ok(id)
    }

    async fn update(&self, id: u64, draft: &RecordDraft) -> Result<(), CatalogError> {
        let mut doc = self.doc.lock().await;
        let record = doc.record_mut(id)?;
        record.title = draft.title.clone();
        record.status = draft.status.clone();
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn set_meta(&self, id: u64, key: &str, value: &str) -> Result<(), CatalogError> {
        let mut doc = self.doc.lock().await;
        let record = doc.record_mut(id)?;
        record.meta.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn photo_signatures(&self, id: u64) -> Result<BTreeMap<String, PhotoSignature>, CatalogError> {
        let doc = self.doc.lock().await;
        doc.records
            .get(&id)
            .map(|r| r.photo_signatures.clone())
            .ok_or(CatalogError::NotFound(id))
    }

    async fn set_photo_signatures(
        &self,
        id: u64,
        signatures: BTreeMap<String, PhotoSignature>,
    ) -> Result<(), CatalogError> {
        let mut doc = self.doc.lock().await;
        doc.record_mut(id)?.photo_signatures = signatures;
        Ok(())
    }

    async fn flush(&self) -> Result<(), CatalogError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = {
            let doc = self.doc.lock().await;
            serde_json::to_vec_pretty(&*doc).map_err(|source| CatalogError::Json {
                path: path.clone(),
                source,
            })?
        };
        write_atomically(path, &bytes)
            .await
            .map_err(|source| CatalogError::Io {
                path: path.clone(),
                source,
            })
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    fs::write(&temp_path, bytes).await?;
    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err)
        }
    }
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    pub attachment_id: u64,
    pub content_hash: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentEntry {
    pub id: u64,
    pub record_id: u64,
    pub source_url: String,
    pub file_name: String,
    pub relative_path: PathBuf,
    pub content_hash: String,
    #[serde(default)]
    pub alt: String,
    pub stored_at: DateTime<Utc>,
}

/// Managed asset store that links downloaded images to catalog records.
#[async_trait]
pub trait MediaLibrary: Send + Sync {
    async fn store(
        &self,
        record_id: u64,
        source_url: &str,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> anyhow::Result<StoredAttachment>;

    async fn set_alt_text(&self, attachment_id: u64, alt: &str) -> anyhow::Result<()>;

    async fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AttachmentIndex {
    next_id: u64,
    attachments: BTreeMap<u64, AttachmentEntry>,
}

/// [`MediaLibrary`] backed by the hash-addressed [`ArtifactStore`] plus a JSON index.
#[derive(Debug)]
pub struct ArtifactMediaLibrary {
    store: ArtifactStore,
    index_path: PathBuf,
    index: Mutex<AttachmentIndex>,
}

impl ArtifactMediaLibrary {
    pub async fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        let index_path = root.join("attachments.json");
        let index = match fs::read(&index_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", index_path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => AttachmentIndex::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", index_path.display()));
            }
        };
        Ok(Self {
            store: ArtifactStore::new(root),
            index_path,
            index: Mutex::new(index),
        })
    }

    pub async fn attachment(&self, id: u64) -> Option<AttachmentEntry> {
        self.index.lock().await.attachments.get(&id).cloned()
    }
}

/// File extension for a downloaded image, preferring the response content type.
pub fn media_extension(url: &str, content_type: Option<&str>) -> String {
    let from_type = content_type.and_then(|ct| {
        let mime = ct.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
        match mime.as_str() {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some("jpg"),
            "image/png" => Some("png"),
            "image/gif" => Some("gif"),
            "image/webp" => Some("webp"),
            _ => None,
        }
    });
    if let Some(ext) = from_type {
        return ext.to_string();
    }

    let path = url.split(['?', '#']).next().unwrap_or_default();
    let last = path.rsplit('/').next().unwrap_or_default();
    match last.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            ext.to_ascii_lowercase()
        }
        _ => "bin".to_string(),
    }
}

/// `id` query parameter of a media URL, used for readable file names.
fn media_query_id(url: &str) -> Option<&str> {
    let (_, query) = url.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "id")
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty() && v.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'))
}

#[async_trait]
impl MediaLibrary for ArtifactMediaLibrary {
    async fn store(
        &self,
        record_id: u64,
        source_url: &str,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> anyhow::Result<StoredAttachment> {
        let stored_at = Utc::now();
        let extension = media_extension(source_url, content_type);
        let blob = self
            .store
            .put(stored_at, &record_id.to_string(), &extension, bytes)
            .await
            .with_context(|| format!("storing media for record {record_id}"))?;
        let content_hash = format!("sha256:{}", blob.digest);

        let mut index = self.index.lock().await;
        let id = index.next_id.max(1);
        index.next_id = id + 1;
        let file_name = format!(
            "media-{}.{}",
            media_query_id(source_url).unwrap_or(&blob.digest[..16]),
            extension
        );
        index.attachments.insert(
            id,
            AttachmentEntry {
                id,
                record_id,
                source_url: source_url.to_string(),
                file_name,
                relative_path: blob.relative_path.clone(),
                content_hash: content_hash.clone(),
                alt: String::new(),
                stored_at,
            },
        );

        Ok(StoredAttachment {
            attachment_id: id,
            content_hash,
            path: self.store.path_of(&blob),
        })
    }

    async fn set_alt_text(&self, attachment_id: u64, alt: &str) -> anyhow::Result<()> {
        if alt.is_empty() {
            return Ok(());
        }
        let mut index = self.index.lock().await;
        let entry = index
            .attachments
            .get_mut(&attachment_id)
            .with_context(|| format!("attachment {attachment_id} not found"))?;
        entry.alt = alt.to_string();
        Ok(())
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let bytes = {
            let index = self.index.lock().await;
            serde_json::to_vec_pretty(&*index).context("serializing attachment index")?
        };
        write_atomically(&self.index_path, &bytes)
            .await
            .with_context(|| format!("writing {}", self.index_path.display()))
    }
}
