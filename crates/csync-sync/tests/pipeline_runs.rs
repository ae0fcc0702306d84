use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use csync_core::{
    CatalogRecord, PhotoCounters, PhotoSignature, RecordDraft, GALLERY_META, SOURCE_ID_META,
    THUMBNAIL_META,
};
use csync_storage::{
    CatalogError, CatalogStore, ConditionalHeaders, FetchError, FetchedResponse, HeadResponse,
    JsonCatalogStore, RemoteMedia,
};
use csync_sync::lock::RunLock;
use csync_sync::notify::{Notification, Notifier, SendMode};
use csync_sync::{RunOutcome, SyncConfig, SyncPipeline};
use tempfile::tempdir;

const ZIP_NAME: &str = "PIVOTELECOM20240101.zip";
const URL_A: &str = "https://media.example.com/photo?id=a1";
const URL_B: &str = "https://media.example.com/photo?id=b2";
const URL_MISSING: &str = "https://media.example.com/photo?id=gone";

#[derive(Default)]
struct FakeRemote {
    etags: Mutex<HashMap<String, String>>,
    downloads: AtomicUsize,
}

impl FakeRemote {
    fn with_photos(photos: &[(&str, &str)]) -> Self {
        let remote = Self::default();
        for (url, etag) in photos {
            remote.set_etag(url, etag);
        }
        remote
    }

    fn set_etag(&self, url: &str, etag: &str) {
        self.etags
            .lock()
            .expect("etags")
            .insert(url.to_string(), etag.to_string());
    }

    fn etag(&self, url: &str) -> Option<String> {
        self.etags.lock().expect("etags").get(url).cloned()
    }
}

#[async_trait]
impl RemoteMedia for FakeRemote {
    async fn head(&self, url: &str, conditional: &ConditionalHeaders) -> Result<HeadResponse, FetchError> {
        let etag = self.etag(url).ok_or_else(|| FetchError::Transport {
            url: url.to_string(),
            message: "connection refused".to_string(),
        })?;
        let status = if conditional.if_none_match.as_deref() == Some(etag.as_str()) {
            304
        } else {
            200
        };
        Ok(HeadResponse {
            status,
            etag: Some(etag),
            last_modified: None,
            content_length: None,
        })
    }

    async fn download(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let etag = self.etag(url).ok_or_else(|| FetchError::HttpStatus {
            status: 404,
            url: url.to_string(),
        })?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(FetchedResponse {
            status: 200,
            final_url: url.to_string(),
            content_type: Some("image/jpeg".to_string()),
            body: format!("{url}#{etag}").into_bytes(),
        })
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        self.sent.lock().expect("sent").push(notification.clone());
        Ok(())
    }
}

/// In-memory catalog whose writes never reach disk.
struct UnwritableCatalog {
    inner: JsonCatalogStore,
}

#[async_trait]
impl CatalogStore for UnwritableCatalog {
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<CatalogRecord>, CatalogError> {
        self.inner.find_by_external_id(external_id).await
    }

    async fn get(&self, id: u64) -> Result<Option<CatalogRecord>, CatalogError> {
        self.inner.get(id).await
    }

    async fn create(&self, draft: &RecordDraft) -> Result<u64, CatalogError> {
        self.inner.create(draft).await
    }

    async fn update(&self, id: u64, draft: &RecordDraft) -> Result<(), CatalogError> {
        self.inner.update(id, draft).await
    }

    async fn set_meta(&self, id: u64, key: &str, value: &str) -> Result<(), CatalogError> {
        self.inner.set_meta(id, key, value).await
    }

    async fn photo_signatures(&self, id: u64) -> Result<BTreeMap<String, PhotoSignature>, CatalogError> {
        self.inner.photo_signatures(id).await
    }

    async fn set_photo_signatures(
        &self,
        id: u64,
        signatures: BTreeMap<String, PhotoSignature>,
    ) -> Result<(), CatalogError> {
        self.inner.set_photo_signatures(id, signatures).await
    }

    async fn flush(&self) -> Result<(), CatalogError> {
        Err(CatalogError::Io {
            path: "catalog.json".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only volume"),
        })
    }
}

fn write_feed_zip(dir: &Path) {
    let file = std::fs::File::create(dir.join(ZIP_NAME)).expect("zip file");
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();

    zip.start_file("INSCRIPTIONS.TXT", options).expect("entry");
    zip.write_all(
        b"\"M100\",\"x\",\"Laval\",\"C1\",\"12\",\"rue Oak\"\r\n\
          \"M200\",\"x\",\"Qu\xe9bec\",\"C2\",\"\",\"\"\r\n",
    )
    .expect("write");

    zip.start_file("PHOTOS.TXT", options).expect("entry");
    let photos = format!(
        "\"M100\",\"2\",\"\",\"\",\"\",\"\",\"{URL_B}\"\n\
         \"M100\",\"1\",\"\",\"\",\"\",\"\",\"{URL_A}\"\n\
         \"M100\",\"3\",\"\",\"\",\"\",\"\",\"{URL_MISSING}\"\n"
    );
    zip.write_all(photos.as_bytes()).expect("write");

    zip.start_file("PIVOTELECOM.ACCDB", options).expect("entry");
    zip.write_all(b"reference").expect("write");
    zip.finish().expect("finish");
}

fn photo_counters(outcome: &RunOutcome) -> PhotoCounters {
    match outcome {
        RunOutcome::Completed(summary) => summary
            .photos_counter_file_bases
            .get(ZIP_NAME)
            .copied()
            .expect("photo counters for feed"),
        RunOutcome::Skipped => panic!("run was skipped"),
    }
}

#[tokio::test]
async fn repeated_runs_are_idempotent_and_refresh_changed_photos() {
    let source = tempdir().expect("source");
    let base = tempdir().expect("base");
    write_feed_zip(source.path());

    let mut config = SyncConfig::new(source.path(), base.path());
    config.dev_mode = true;
    config.header_row_is_data = true;

    let catalog = Arc::new(JsonCatalogStore::in_memory());
    let remote = Arc::new(FakeRemote::with_photos(&[(URL_A, "\"a-1\""), (URL_B, "\"b-1\"")]));
    let pipeline = SyncPipeline::from_config(config)
        .await
        .expect("pipeline")
        .with_catalog(catalog.clone())
        .with_remote(remote.clone());

    let first = pipeline.run_once().await.expect("first run");
    let RunOutcome::Completed(summary) = &first else {
        panic!("first run skipped");
    };
    assert_eq!(summary.changes_tracked.created, 2);
    assert_eq!(summary.changes_tracked.updated, 0);
    assert!(summary.ended_at.is_some() && summary.duration.is_some());
    let counters = photo_counters(&first);
    assert_eq!(counters.total_photos_processed, 3);
    assert_eq!(counters.downloaded_new, 2);
    assert_eq!(counters.total_photos_failed, 1);
    assert_eq!(remote.downloads.load(Ordering::SeqCst), 2);

    let listing = catalog
        .find_by_external_id("M100")
        .await
        .expect("find")
        .expect("listing");
    assert_eq!(listing.title, "rue Oak Laval");
    assert_eq!(listing.meta.get(SOURCE_ID_META).map(String::as_str), Some("20240101"));
    let id_a = listing.photo_signatures[URL_A].attachment_id.expect("a stored");
    let id_b = listing.photo_signatures[URL_B].attachment_id.expect("b stored");
    assert_eq!(listing.meta.get(THUMBNAIL_META), Some(&id_a.to_string()));
    assert_eq!(listing.meta.get(GALLERY_META), Some(&format!("{id_a},{id_b}")));

    let quebec = catalog
        .find_by_external_id("M200")
        .await
        .expect("find")
        .expect("listing");
    assert_eq!(quebec.title, "Québec");

    let second = pipeline.run_once().await.expect("second run");
    let RunOutcome::Completed(summary) = &second else {
        panic!("second run skipped");
    };
    assert_eq!(summary.changes_tracked.created, 0);
    assert_eq!(summary.changes_tracked.updated, 0);
    assert!(summary.changes_tracked.unchanged > 0);
    let counters = photo_counters(&second);
    assert_eq!(counters.skipped_unchanged, 2);
    assert_eq!(counters.downloaded_new + counters.downloaded_updated, 0);
    assert_eq!(remote.downloads.load(Ordering::SeqCst), 2);

    remote.set_etag(URL_B, "\"b-2\"");
    let third = pipeline.run_once().await.expect("third run");
    let counters = photo_counters(&third);
    assert_eq!(counters.downloaded_updated, 1);
    assert_eq!(counters.skipped_unchanged, 1);

    let listing = catalog
        .find_by_external_id("M100")
        .await
        .expect("find")
        .expect("listing");
    let new_b = listing.photo_signatures[URL_B].attachment_id.expect("b stored");
    assert_ne!(new_b, id_b);
    assert_eq!(listing.photo_signatures[URL_B].etag.as_deref(), Some("\"b-2\""));
    assert_eq!(listing.meta.get(GALLERY_META), Some(&format!("{id_a},{new_b}")));

    let summaries = std::fs::read_dir(base.path().join("reports"))
        .expect("reports")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("sync-summary-"))
        .count();
    assert_eq!(summaries, 3);
    assert!(source.path().join(ZIP_NAME).exists(), "dev mode keeps the original");
    assert!(!base.path().join("chs_run.lock").exists());
}

#[tokio::test]
async fn held_lock_skips_the_run_and_archives_nothing() {
    let source = tempdir().expect("source");
    let base = tempdir().expect("base");
    write_feed_zip(source.path());

    let config = SyncConfig::new(source.path(), base.path());
    let lock = RunLock::new(
        config.lock_path(),
        Duration::from_secs(config.lock_ttl_secs),
        config.timezone,
    );
    assert!(lock.acquire().await.expect("hold lock"));

    let pipeline = SyncPipeline::from_config(config)
        .await
        .expect("pipeline")
        .with_remote(Arc::new(FakeRemote::default()));
    let outcome = pipeline.run_once().await.expect("run");
    assert_eq!(outcome, RunOutcome::Skipped);
    assert!(source.path().join(ZIP_NAME).exists());
    assert!(!base.path().join("reports").exists());
}

#[tokio::test]
async fn corrupt_archive_moves_to_failed_and_siblings_continue() {
    let source = tempdir().expect("source");
    let base = tempdir().expect("base");
    std::fs::write(source.path().join("PIVOTELECOM1.zip"), b"not a zip").expect("write");
    write_feed_zip(source.path());

    let mut config = SyncConfig::new(source.path(), base.path());
    config.header_row_is_data = true;
    let pipeline = SyncPipeline::from_config(config)
        .await
        .expect("pipeline")
        .with_remote(Arc::new(FakeRemote::default()));

    let outcome = pipeline.run_once().await.expect("run");
    let RunOutcome::Completed(summary) = outcome else {
        panic!("run skipped");
    };
    assert_eq!(summary.changes_tracked.created, 2);

    let failed_files: Vec<_> = walk(&base.path().join("failed"));
    let archived_files: Vec<_> = walk(&base.path().join("archived"));
    assert_eq!(failed_files, vec!["PIVOTELECOM1.zip".to_string()]);
    assert_eq!(archived_files, vec![ZIP_NAME.to_string()]);
    assert!(std::fs::read_dir(source.path()).expect("source").next().is_none());
}

#[tokio::test]
async fn failed_run_still_sends_report() {
    let source = tempdir().expect("source");
    let base = tempdir().expect("base");
    write_feed_zip(source.path());
    std::fs::write(base.path().join("extracted"), b"not a directory").expect("blocker");

    let mut config = SyncConfig::new(source.path(), base.path());
    config.send_mode = SendMode::Error;
    let notifier = Arc::new(RecordingNotifier::default());
    let pipeline = SyncPipeline::from_config(config)
        .await
        .expect("pipeline")
        .with_remote(Arc::new(FakeRemote::default()))
        .with_notifier(notifier.clone());

    let err = pipeline.run_once().await.expect_err("extracted/ cannot be reset");
    assert!(format!("{err:#}").contains("extracted"));

    let sent = notifier.sent.lock().expect("sent");
    assert_eq!(sent.len(), 1);
    assert!(sent[0].body.contains("sync run failed"));
    assert!(sent[0].body.contains("- Ended:"));
    assert!(!sent[0].body.contains("in progress"));
    assert!(!base.path().join("chs_run.lock").exists());
    assert!(source.path().join(ZIP_NAME).exists());
}

#[tokio::test]
async fn unsaved_catalog_sends_source_to_failed() {
    let source = tempdir().expect("source");
    let base = tempdir().expect("base");
    write_feed_zip(source.path());

    let mut config = SyncConfig::new(source.path(), base.path());
    config.header_row_is_data = true;
    let pipeline = SyncPipeline::from_config(config)
        .await
        .expect("pipeline")
        .with_catalog(Arc::new(UnwritableCatalog {
            inner: JsonCatalogStore::in_memory(),
        }))
        .with_remote(Arc::new(FakeRemote::default()));

    let outcome = pipeline.run_once().await.expect("run");
    assert!(matches!(outcome, RunOutcome::Completed(_)));
    assert_eq!(walk(&base.path().join("failed")), vec![ZIP_NAME.to_string()]);
    assert!(!base.path().join("archived").exists());
}

fn walk(root: &Path) -> Vec<String> {
    let mut names = Vec::new();
    for day in std::fs::read_dir(root).expect("bucket").filter_map(|e| e.ok()) {
        for file in std::fs::read_dir(day.path()).expect("day").filter_map(|e| e.ok()) {
            names.push(file.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    names
}
