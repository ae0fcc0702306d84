//! Conditional photo refresh: HEAD check, reuse or download, gallery rebuild.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use csync_core::{
    MappedRecord, PhotoCounters, PhotoSignature, GALLERY_META, IMAGE_URL_FIELD, MEDIA_ORDER_FIELD,
    THUMBNAIL_META,
};
use csync_storage::{
    ArtifactStore, CatalogError, CatalogStore, ConditionalHeaders, FetchError, HeadResponse,
    MediaLibrary, RemoteMedia,
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PhotoError {
    #[error("photo row has no image url")]
    MissingUrl,
    #[error("photo row has no external id")]
    MissingExternalId,
    #[error("no catalog record for external id {0}")]
    UnknownRecord(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("media library: {0:#}")]
    Media(anyhow::Error),
}

/// Terminal state of one photo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhotoOutcome {
    Reused { record_id: u64, url: String },
    Downloaded { record_id: u64, url: String, attachment_id: u64, replaced: bool },
    Failed { url: Option<String>, reason: String },
}

fn same_validator(previous: &Option<String>, current: &Option<String>) -> bool {
    match (previous.as_deref(), current.as_deref()) {
        (Some(a), Some(b)) => !a.is_empty() && a == b,
        _ => false,
    }
}

/// Any of etag, last-modified or content-length equal and non-empty on both sides.
pub fn signature_matches(previous: &PhotoSignature, head: &HeadResponse) -> bool {
    same_validator(&previous.etag, &head.etag)
        || same_validator(&previous.last_modified, &head.last_modified)
        || same_validator(&previous.content_length, &head.content_length)
}

fn merge_validators(signature: &mut PhotoSignature, head: &HeadResponse) {
    if head.etag.is_some() {
        signature.etag = head.etag.clone();
    }
    if head.last_modified.is_some() {
        signature.last_modified = head.last_modified.clone();
    }
    if head.content_length.is_some() {
        signature.content_length = head.content_length.clone();
    }
}

/// Attachment ids ordered by `order`, then by URL.
pub fn gallery_order(signatures: &BTreeMap<String, PhotoSignature>) -> Vec<u64> {
    let mut entries: Vec<(&u32, &String, u64)> = signatures
        .iter()
        .filter_map(|(url, sig)| sig.attachment_id.map(|id| (&sig.order, url, id)))
        .collect();
    entries.sort();
    entries.into_iter().map(|(_, _, id)| id).collect()
}

pub struct PhotoSync {
    catalog: Arc<dyn CatalogStore>,
    remote: Arc<dyn RemoteMedia>,
    media: Arc<dyn MediaLibrary>,
    touched: BTreeSet<u64>,
}

impl PhotoSync {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        remote: Arc<dyn RemoteMedia>,
        media: Arc<dyn MediaLibrary>,
    ) -> Self {
        Self {
            catalog,
            remote,
            media,
            touched: BTreeSet::new(),
        }
    }

    /// Process one mapped PHOTOS row and update `counters`. Never fails the caller.
    pub async fn sync_row(&mut self, row: &MappedRecord, counters: &mut PhotoCounters) -> PhotoOutcome {
        counters.total_photos_processed += 1;
        let url = row.non_empty(IMAGE_URL_FIELD).map(str::to_string);
        let outcome = match self.process(row).await {
            Ok(outcome) => outcome,
            Err(err) => PhotoOutcome::Failed {
                url,
                reason: err.to_string(),
            },
        };
        match &outcome {
            PhotoOutcome::Reused { record_id, url } => {
                counters.skipped_unchanged += 1;
                debug!(record_id, url = %url, "photo unchanged");
            }
            PhotoOutcome::Downloaded {
                record_id,
                url,
                attachment_id,
                replaced,
            } => {
                if *replaced {
                    counters.downloaded_updated += 1;
                } else {
                    counters.downloaded_new += 1;
                }
                info!(record_id, url = %url, attachment_id, replaced, "photo downloaded");
            }
            PhotoOutcome::Failed { url, reason } => {
                counters.total_photos_failed += 1;
                warn!(url = url.as_deref().unwrap_or("-"), reason = %reason, "photo failed");
            }
        }
        outcome
    }

    async fn process(&mut self, row: &MappedRecord) -> Result<PhotoOutcome, PhotoError> {
        let url = row.non_empty(IMAGE_URL_FIELD).ok_or(PhotoError::MissingUrl)?;
        let external_id = row.external_id().ok_or(PhotoError::MissingExternalId)?;
        let order = row
            .non_empty(MEDIA_ORDER_FIELD)
            .and_then(|o| o.parse::<u32>().ok())
            .unwrap_or(1);
        let record = self
            .catalog
            .find_by_external_id(external_id)
            .await?
            .ok_or_else(|| PhotoError::UnknownRecord(external_id.to_string()))?;
        let record_id = record.id;
        let alt = record_id.to_string();

        let mut signatures = self.catalog.photo_signatures(record_id).await?;
        let previous = signatures.get(url).cloned();

        let head = self
            .remote
            .head(url, &ConditionalHeaders::from_signature(previous.as_ref()))
            .await?;

        if let Some(prev) = &previous {
            if prev.attachment_id.is_some() && (head.is_not_modified() || signature_matches(prev, &head)) {
                let mut refreshed = prev.clone();
                merge_validators(&mut refreshed, &head);
                refreshed.order = order;
                refreshed.alt = alt;
                signatures.insert(url.to_string(), refreshed);
                self.catalog.set_photo_signatures(record_id, signatures).await?;
                self.touched.insert(record_id);
                return Ok(PhotoOutcome::Reused {
                    record_id,
                    url: url.to_string(),
                });
            }
        }

        let fetched = self.remote.download(url).await?;
        let stored = self
            .media
            .store(record_id, url, fetched.content_type.as_deref(), &fetched.body)
            .await
            .map_err(PhotoError::Media)?;
        self.media
            .set_alt_text(stored.attachment_id, &alt)
            .await
            .map_err(PhotoError::Media)?;

        let signature = PhotoSignature {
            etag: head.etag.clone(),
            last_modified: head.last_modified.clone(),
            content_length: head
                .content_length
                .clone()
                .or_else(|| Some(fetched.body.len().to_string())),
            body_hash: Some(ArtifactStore::body_hash(&fetched.body)),
            attachment_id: Some(stored.attachment_id),
            order,
            alt,
        };
        signatures.insert(url.to_string(), signature);
        self.catalog.set_photo_signatures(record_id, signatures).await?;
        self.touched.insert(record_id);

        Ok(PhotoOutcome::Downloaded {
            record_id,
            url: url.to_string(),
            attachment_id: stored.attachment_id,
            replaced: previous.is_some(),
        })
    }

    /// Rewrite thumbnail and gallery meta for every record touched since the last call.
    pub async fn rebuild_galleries(&mut self) -> Result<usize, CatalogError> {
        let touched = std::mem::take(&mut self.touched);
        for record_id in &touched {
            let signatures = self.catalog.photo_signatures(*record_id).await?;
            let ids = gallery_order(&signatures);
            let Some(first) = ids.first() else { continue };
            let gallery = ids
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(",");
            self.catalog
                .set_meta(*record_id, THUMBNAIL_META, &first.to_string())
                .await?;
            self.catalog.set_meta(*record_id, GALLERY_META, &gallery).await?;
        }
        Ok(touched.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use csync_core::{PublicationStatus, RecordDraft, EXTERNAL_ID_FIELD};
    use csync_storage::{ArtifactMediaLibrary, FetchedResponse, JsonCatalogStore};
    use tempfile::tempdir;

    const URL: &str = "https://media.example.com/photo?id=p1";

    struct StaticRemote {
        head: HeadResponse,
        body: Vec<u8>,
        downloads: AtomicUsize,
    }

    #[async_trait]
    impl RemoteMedia for StaticRemote {
        async fn head(&self, _url: &str, _conditional: &ConditionalHeaders) -> Result<HeadResponse, FetchError> {
            Ok(self.head.clone())
        }

        async fn download(&self, url: &str) -> Result<FetchedResponse, FetchError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            Ok(FetchedResponse {
                status: 200,
                final_url: url.to_string(),
                content_type: Some("image/jpeg".to_string()),
                body: self.body.clone(),
            })
        }
    }

    fn photo_row(order: Option<&str>) -> MappedRecord {
        let mut row = MappedRecord::default();
        row.fields.insert(EXTERNAL_ID_FIELD.to_string(), "M1".to_string());
        row.fields.insert(IMAGE_URL_FIELD.to_string(), URL.to_string());
        if let Some(order) = order {
            row.fields.insert(MEDIA_ORDER_FIELD.to_string(), order.to_string());
        }
        row
    }

    /// Catalog holding listing `M1` with one stored photo signature for [`URL`].
    async fn catalog_with_photo(previous: PhotoSignature) -> (Arc<JsonCatalogStore>, u64) {
        let catalog = Arc::new(JsonCatalogStore::in_memory());
        let id = catalog
            .create(&RecordDraft {
                external_id: "M1".into(),
                title: "Listing".into(),
                status: PublicationStatus::Publish,
            })
            .await
            .expect("create");
        let mut signatures = BTreeMap::new();
        signatures.insert(URL.to_string(), previous);
        catalog.set_photo_signatures(id, signatures).await.expect("signatures");
        (catalog, id)
    }

    #[tokio::test]
    async fn matching_etag_on_full_head_reuses_attachment() {
        let media_dir = tempdir().expect("tempdir");
        let (catalog, id) = catalog_with_photo(PhotoSignature {
            etag: Some("\"v1\"".into()),
            attachment_id: Some(42),
            order: 1,
            ..Default::default()
        })
        .await;
        let remote = Arc::new(StaticRemote {
            head: HeadResponse {
                status: 200,
                etag: Some("\"v1\"".into()),
                ..Default::default()
            },
            body: Vec::new(),
            downloads: AtomicUsize::new(0),
        });
        let media = Arc::new(ArtifactMediaLibrary::open(media_dir.path()).await.expect("media"));
        let mut sync = PhotoSync::new(catalog.clone(), remote.clone(), media);
        let mut counters = PhotoCounters::default();

        let outcome = sync.sync_row(&photo_row(Some("1")), &mut counters).await;

        assert_eq!(
            outcome,
            PhotoOutcome::Reused {
                record_id: id,
                url: URL.to_string()
            }
        );
        assert_eq!(remote.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(counters.skipped_unchanged, 1);
        let stored = catalog.photo_signatures(id).await.expect("signatures");
        assert_eq!(stored[URL].attachment_id, Some(42));
    }

    #[tokio::test]
    async fn content_length_change_downloads_replacement() {
        let media_dir = tempdir().expect("tempdir");
        let (catalog, id) = catalog_with_photo(PhotoSignature {
            etag: Some("\"v1\"".into()),
            content_length: Some("1000".into()),
            attachment_id: Some(42),
            order: 1,
            ..Default::default()
        })
        .await;
        let body = vec![7u8; 2000];
        let remote = Arc::new(StaticRemote {
            head: HeadResponse {
                status: 200,
                etag: Some("\"v2\"".into()),
                content_length: Some("2000".into()),
                ..Default::default()
            },
            body: body.clone(),
            downloads: AtomicUsize::new(0),
        });
        let media = Arc::new(ArtifactMediaLibrary::open(media_dir.path()).await.expect("media"));
        let mut sync = PhotoSync::new(catalog.clone(), remote.clone(), media);
        let mut counters = PhotoCounters::default();

        let outcome = sync.sync_row(&photo_row(Some("1")), &mut counters).await;

        assert!(matches!(outcome, PhotoOutcome::Downloaded { replaced: true, .. }));
        assert_eq!(remote.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(counters.downloaded_updated, 1);
        assert_eq!(counters.downloaded_new, 0);
        let stored = catalog.photo_signatures(id).await.expect("signatures");
        let signature = &stored[URL];
        assert_eq!(signature.body_hash.as_deref(), Some(ArtifactStore::body_hash(&body).as_str()));
        assert_eq!(signature.content_length.as_deref(), Some("2000"));
        assert_eq!(signature.etag.as_deref(), Some("\"v2\""));
        assert_ne!(signature.attachment_id, Some(42));
    }

    #[tokio::test]
    async fn missing_media_order_defaults_to_first_position() {
        let media_dir = tempdir().expect("tempdir");
        let catalog = Arc::new(JsonCatalogStore::in_memory());
        let id = catalog
            .create(&RecordDraft {
                external_id: "M1".into(),
                title: "Listing".into(),
                status: PublicationStatus::Publish,
            })
            .await
            .expect("create");
        let remote = Arc::new(StaticRemote {
            head: HeadResponse {
                status: 200,
                ..Default::default()
            },
            body: b"jpeg".to_vec(),
            downloads: AtomicUsize::new(0),
        });
        let media = Arc::new(ArtifactMediaLibrary::open(media_dir.path()).await.expect("media"));
        let mut sync = PhotoSync::new(catalog.clone(), remote, media);
        let mut counters = PhotoCounters::default();

        sync.sync_row(&photo_row(None), &mut counters).await;

        let stored = catalog.photo_signatures(id).await.expect("signatures");
        assert_eq!(stored[URL].order, 1);
        assert_eq!(counters.downloaded_new, 1);
    }

    fn sig(order: u32, id: u64) -> PhotoSignature {
        PhotoSignature {
            attachment_id: Some(id),
            order,
            ..Default::default()
        }
    }

    #[test]
    fn gallery_sorts_by_order_then_url() {
        let mut signatures = BTreeMap::new();
        signatures.insert("https://img/b.jpg".to_string(), sig(2, 20));
        signatures.insert("https://img/a.jpg".to_string(), sig(2, 10));
        signatures.insert("https://img/z.jpg".to_string(), sig(0, 30));
        signatures.insert(
            "https://img/none.jpg".to_string(),
            PhotoSignature::default(),
        );
        assert_eq!(gallery_order(&signatures), vec![30, 10, 20]);
    }

    #[test]
    fn any_shared_validator_counts_as_match() {
        let previous = PhotoSignature {
            etag: Some("\"abc\"".into()),
            content_length: Some("100".into()),
            ..Default::default()
        };
        let mut head = HeadResponse {
            status: 200,
            etag: Some("\"other\"".into()),
            content_length: Some("100".into()),
            ..Default::default()
        };
        assert!(signature_matches(&previous, &head));
        head.content_length = Some("101".into());
        assert!(!signature_matches(&previous, &head));
        head.content_length = None;
        assert!(!signature_matches(&PhotoSignature::default(), &head));
    }
}
