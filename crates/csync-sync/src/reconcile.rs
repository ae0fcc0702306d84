//! Upserts mapped listings into the catalog and classifies each change.

use std::path::Path;
use std::sync::Arc;

use csync_core::{
    CatalogRecord, ChangeCounters, MappedRecord, PublicationStatus, RecordDraft, ADDRESS_FIELD,
    CITY_FIELD, SOURCE_FILE_META, SOURCE_ID_META, STATUS_FIELD, TITLE_FIELD,
};
use csync_storage::{CatalogError, CatalogStore};
use tracing::{debug, info, warn};

/// Fields applied to the record itself rather than stored as meta.
const RESERVED_FIELDS: [&str; 2] = [TITLE_FIELD, STATUS_FIELD];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Created,
    Unchanged,
    Updated,
}

pub fn incoming_status(record: &MappedRecord) -> PublicationStatus {
    record
        .non_empty(STATUS_FIELD)
        .map(PublicationStatus::parse)
        .unwrap_or_default()
}

/// Explicit title, else `"<address> <city>"`, else `None`.
pub fn derived_title(record: &MappedRecord) -> Option<String> {
    if let Some(title) = record.non_empty(TITLE_FIELD) {
        return Some(title.to_string());
    }
    let address = record.non_empty(ADDRESS_FIELD).unwrap_or_default();
    let city = record.non_empty(CITY_FIELD).unwrap_or_default();
    let joined = format!("{address} {city}").trim().to_string();
    (!joined.is_empty()).then_some(joined)
}

pub fn fallback_title(external_id: &str) -> String {
    format!("Property {external_id}")
}

/// Trailing digit run of the file's base name, `"0"` when there is none.
pub fn source_id_for(origin_file: &Path) -> String {
    let stem = origin_file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let digits: String = stem
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        "0".to_string()
    } else {
        digits
    }
}

/// Apply the status transition to the counters.
pub fn classify(
    counters: &mut ChangeCounters,
    previous: &PublicationStatus,
    incoming: &PublicationStatus,
) -> Classification {
    if previous == incoming {
        counters.unchanged += 1;
        return Classification::Unchanged;
    }
    counters.updated += 1;
    match (previous, incoming) {
        (PublicationStatus::Draft, PublicationStatus::Publish) => counters.reactivated += 1,
        (PublicationStatus::Publish, next) if next.is_removal() => counters.expired += 1,
        (PublicationStatus::Publish, _) => counters.unpublished += 1,
        _ => {}
    }
    Classification::Updated
}

pub struct Reconciler {
    catalog: Arc<dyn CatalogStore>,
    counters: ChangeCounters,
}

impl Reconciler {
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self {
            catalog,
            counters: ChangeCounters::default(),
        }
    }

    pub fn counters(&self) -> ChangeCounters {
        self.counters
    }

    /// Upsert every record; per-record failures are logged and skipped.
    pub async fn upsert(&mut self, records: &[MappedRecord], origin_file: &Path) -> Vec<u64> {
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let Some(external_id) = record.external_id() else {
                warn!(origin = %origin_file.display(), "row without external id skipped");
                continue;
            };
            match self.upsert_one(external_id, record, origin_file).await {
                Ok(id) => ids.push(id),
                Err(err) => {
                    warn!(external_id, error = %err, "catalog write failed, record skipped");
                }
            }
        }
        ids
    }

    async fn upsert_one(
        &mut self,
        external_id: &str,
        record: &MappedRecord,
        origin_file: &Path,
    ) -> Result<u64, CatalogError> {
        let status = incoming_status(record);
        let existing = self.catalog.find_by_external_id(external_id).await?;

        let id = match &existing {
            Some(current) => {
                let draft = RecordDraft {
                    external_id: external_id.to_string(),
                    title: derived_title(record).unwrap_or_else(|| current.title.clone()),
                    status: status.clone(),
                };
                self.catalog.update(current.id, &draft).await?;
                let class = classify(&mut self.counters, &current.status, &status);
                debug!(external_id, id = current.id, ?class, "record reconciled");
                current.id
            }
            None => {
                let draft = RecordDraft {
                    external_id: external_id.to_string(),
                    title: derived_title(record).unwrap_or_else(|| fallback_title(external_id)),
                    status,
                };
                let id = self.catalog.create(&draft).await?;
                self.counters.created += 1;
                info!(external_id, id, "created record");
                id
            }
        };

        for (key, value) in &record.fields {
            if value.is_empty() || RESERVED_FIELDS.contains(&key.as_str()) {
                continue;
            }
            self.catalog.set_meta(id, key, value).await?;
        }
        self.write_origin(id, existing.as_ref(), origin_file).await?;
        Ok(id)
    }

    async fn write_origin(
        &self,
        id: u64,
        existing: Option<&CatalogRecord>,
        origin_file: &Path,
    ) -> Result<(), CatalogError> {
        let file_name = origin_file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let source_id = source_id_for(origin_file);
        for (key, value) in [(SOURCE_FILE_META, file_name), (SOURCE_ID_META, source_id)] {
            let current = existing.and_then(|r| r.meta.get(key));
            if current != Some(&value) {
                self.catalog.set_meta(id, key, &value).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csync_core::EXTERNAL_ID_FIELD;
    use csync_storage::JsonCatalogStore;
    use std::collections::BTreeMap;

    fn mapped(pairs: &[(&str, &str)]) -> MappedRecord {
        MappedRecord {
            fields: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn titles_fall_back_to_address_and_city() {
        assert_eq!(
            derived_title(&mapped(&[(TITLE_FIELD, "Loft"), (ADDRESS_FIELD, "1 Main")])),
            Some("Loft".into())
        );
        assert_eq!(
            derived_title(&mapped(&[(ADDRESS_FIELD, "1 Main"), (CITY_FIELD, "")])),
            Some("1 Main".into())
        );
        assert_eq!(derived_title(&mapped(&[(TITLE_FIELD, "")])), None);
        assert_eq!(fallback_title("M1"), "Property M1");
    }

    #[test]
    fn source_id_is_trailing_digit_run() {
        assert_eq!(source_id_for(Path::new("/in/PIVOTELECOM20240101.zip")), "20240101");
        assert_eq!(source_id_for(Path::new("INSCRIPTIONS.TXT")), "0");
    }

    #[test]
    fn transitions_update_secondary_counters() {
        let mut c = ChangeCounters::default();
        use PublicationStatus::*;
        assert_eq!(classify(&mut c, &Publish, &Publish), Classification::Unchanged);
        assert_eq!(classify(&mut c, &Draft, &Publish), Classification::Updated);
        classify(&mut c, &Publish, &Sold);
        classify(&mut c, &Publish, &Draft);
        classify(&mut c, &Pending, &Draft);
        assert_eq!(
            c,
            ChangeCounters {
                created: 0,
                updated: 4,
                unpublished: 1,
                unchanged: 1,
                reactivated: 1,
                expired: 1,
            }
        );
    }

    #[tokio::test]
    async fn upsert_creates_then_leaves_unchanged_and_skips_empty_meta() {
        let catalog = Arc::new(JsonCatalogStore::in_memory());
        let mut reconciler = Reconciler::new(catalog.clone());
        let rows = vec![
            mapped(&[
                (EXTERNAL_ID_FIELD, "M1"),
                (ADDRESS_FIELD, "12 Oak"),
                (CITY_FIELD, "Laval"),
                ("_houzez_property_price", ""),
            ]),
            mapped(&[(EXTERNAL_ID_FIELD, ""), (ADDRESS_FIELD, "ignored")]),
        ];
        let origin = Path::new("PIVOTELECOM77.zip");

        let ids = reconciler.upsert(&rows, origin).await;
        assert_eq!(ids.len(), 1);
        let record = catalog.get(ids[0]).await.expect("get").expect("record");
        assert_eq!(record.title, "12 Oak Laval");
        assert!(!record.meta.contains_key("_houzez_property_price"));
        assert_eq!(record.meta.get(SOURCE_ID_META).map(String::as_str), Some("77"));
        assert_eq!(
            record.meta.get(SOURCE_FILE_META).map(String::as_str),
            Some("PIVOTELECOM77.zip")
        );

        reconciler.upsert(&rows, origin).await;
        let counters = reconciler.counters();
        assert_eq!(counters.created, 1);
        assert_eq!(counters.unchanged, 1);
        assert_eq!(counters.updated, 0);
    }

    #[tokio::test]
    async fn satellite_rows_keep_existing_title() {
        let catalog = Arc::new(JsonCatalogStore::in_memory());
        let mut reconciler = Reconciler::new(catalog.clone());
        let origin = Path::new("feed.zip");
        let ids = reconciler
            .upsert(&[mapped(&[(EXTERNAL_ID_FIELD, "M2"), (TITLE_FIELD, "Condo")])], origin)
            .await;
        reconciler
            .upsert(&[mapped(&[(EXTERNAL_ID_FIELD, "M2"), ("_houzez_property_images", "u")])], origin)
            .await;
        let record = catalog.get(ids[0]).await.expect("get").expect("record");
        assert_eq!(record.title, "Condo");
        assert!(!record.meta.contains_key(TITLE_FIELD));
    }

    #[tokio::test]
    async fn status_changes_are_counted() {
        let catalog = Arc::new(JsonCatalogStore::in_memory());
        let mut reconciler = Reconciler::new(catalog.clone());
        let origin = Path::new("feed.zip");
        reconciler
            .upsert(&[mapped(&[(EXTERNAL_ID_FIELD, "M3")])], origin)
            .await;
        reconciler
            .upsert(&[mapped(&[(EXTERNAL_ID_FIELD, "M3"), (STATUS_FIELD, "expired")])], origin)
            .await;
        let counters = reconciler.counters();
        assert_eq!((counters.created, counters.updated, counters.expired), (1, 1, 1));
        let record = catalog
            .find_by_external_id("M3")
            .await
            .expect("find")
            .expect("record");
        assert_eq!(record.status, PublicationStatus::Expired);
    }
}
