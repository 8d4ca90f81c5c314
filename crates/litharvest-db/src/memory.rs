//! Process-local record store used by tests and `--dry-run`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use litharvest_common::{NaturalKey, Record};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{DbError, Result};
use crate::schema::StoredRecord;
use crate::store::RecordStore;

#[derive(Default)]
struct Tables {
    rows: HashMap<Uuid, StoredRecord>,
    by_natural_key: HashMap<String, Uuid>,
    by_pmid: HashMap<String, Uuid>,
    by_arxiv: HashMap<String, Uuid>,
}

impl Tables {
    fn index(&mut self, id: Uuid, record: &Record) {
        self.by_natural_key.insert(record.natural_key.clone(), id);
        for key in record.lookup_keys() {
            match key {
                NaturalKey::Pmid(v) => self.by_pmid.insert(v, id),
                NaturalKey::ArxivId(v) => self.by_arxiv.insert(v, id),
            };
        }
    }

    fn unindex(&mut self, record: &Record) {
        self.by_natural_key.remove(&record.natural_key);
        for key in record.lookup_keys() {
            match key {
                NaturalKey::Pmid(v) => self.by_pmid.remove(&v),
                NaturalKey::ArxivId(v) => self.by_arxiv.remove(&v),
            };
        }
    }

    /// Id of another row already holding one of `record`'s unique keys.
    fn conflicting(&self, record: &Record, own: Option<Uuid>) -> Option<String> {
        let mut owners = vec![(
            format!("natural_key={}", record.natural_key),
            self.by_natural_key.get(&record.natural_key),
        )];
        for key in record.lookup_keys() {
            let owner = match &key {
                NaturalKey::Pmid(v) => self.by_pmid.get(v),
                NaturalKey::ArxivId(v) => self.by_arxiv.get(v),
            };
            owners.push((format!("{}={}", key.column(), key.value()), owner));
        }
        owners
            .into_iter()
            .find(|(_, owner)| matches!(owner, Some(id) if Some(**id) != own))
            .map(|(desc, _)| desc)
    }
}

/// In-memory [`RecordStore`] with the same uniqueness rules as the
/// PostgreSQL schema.
#[derive(Default)]
pub struct InMemoryRecordStore {
    tables: RwLock<Tables>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate with records, e.g. to simulate an existing corpus.
    pub async fn seed(&self, records: impl IntoIterator<Item = Record>) -> Result<()> {
        for record in records {
            self.insert(&record).await?;
        }
        Ok(())
    }

    pub async fn all(&self) -> Vec<StoredRecord> {
        let tables = self.tables.read().await;
        let mut rows: Vec<_> = tables.rows.values().cloned().collect();
        rows.sort_by_key(|r| r.created_at);
        rows
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<StoredRecord>> {
        let tables = self.tables.read().await;
        let id = match key {
            NaturalKey::Pmid(v) => tables.by_pmid.get(v),
            NaturalKey::ArxivId(v) => tables.by_arxiv.get(v),
        };
        Ok(id.and_then(|id| tables.rows.get(id)).cloned())
    }

    async fn insert(&self, record: &Record) -> Result<Uuid> {
        let mut tables = self.tables.write().await;
        if let Some(conflict) = tables.conflicting(record, None) {
            return Err(DbError::Duplicate(conflict));
        }
        let stored = StoredRecord::new(record.clone());
        let id = stored.id;
        tables.index(id, record);
        tables.rows.insert(id, stored);
        Ok(id)
    }

    async fn update(&self, id: Uuid, record: &Record) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(conflict) = tables.conflicting(record, Some(id)) {
            return Err(DbError::Duplicate(conflict));
        }
        let previous = tables
            .rows
            .get(&id)
            .map(|row| row.record.clone())
            .ok_or_else(|| DbError::NotFound(id.to_string()))?;
        tables.unindex(&previous);
        tables.index(id, record);
        if let Some(row) = tables.rows.get_mut(&id) {
            row.record = record.clone();
            row.updated_at = Utc::now();
            row.synced_at = None;
        }
        Ok(())
    }

    async fn count_all(&self) -> Result<u64> {
        Ok(self.tables.read().await.rows.len() as u64)
    }

    async fn records_lacking_downstream_sync(&self, limit: usize) -> Result<Vec<StoredRecord>> {
        let tables = self.tables.read().await;
        let mut pending: Vec<_> = tables
            .rows
            .values()
            .filter(|r| r.needs_sync())
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.updated_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_synced(&self, ids: &[Uuid]) -> Result<usize> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        let mut touched = 0;
        for id in ids {
            if let Some(row) = tables.rows.get_mut(id) {
                row.synced_at = Some(now.max(row.updated_at));
                touched += 1;
            }
        }
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::UpsertOutcome;
    use litharvest_common::{ExternalIds, PublicationDate, RecordSource};
    use pretty_assertions::assert_eq;

    fn pubmed(pmid: &str, title: &str) -> Record {
        Record {
            source: RecordSource::PubMed,
            natural_key: pmid.to_string(),
            title: title.to_string(),
            authors: vec!["Ada Lovelace".to_string()],
            abstract_text: "Abstract.".to_string(),
            published: PublicationDate::Year { year: 2020 },
            journal: None,
            ids: ExternalIds { pmid: Some(pmid.to_string()), ..Default::default() },
            subjects: vec![],
            publication_types: vec![],
            full_text_url: None,
            full_text: None,
        }
    }

    fn arxiv(id: &str, title: &str) -> Record {
        Record {
            source: RecordSource::Arxiv,
            natural_key: id.to_string(),
            title: title.to_string(),
            authors: vec![],
            abstract_text: String::new(),
            published: PublicationDate::Unresolved { raw: None },
            journal: None,
            ids: ExternalIds { arxiv_id: Some(id.to_string()), ..Default::default() },
            subjects: vec!["cs.LG".to_string()],
            publication_types: vec![],
            full_text_url: None,
            full_text: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = InMemoryRecordStore::new();
        let r = pubmed("111", "First");

        let first = store.upsert_by_natural_key(&r).await.unwrap();
        let second = store.upsert_by_natural_key(&r).await.unwrap();

        assert!(first.is_insert());
        assert_eq!(second, UpsertOutcome::Updated(first.id()));
        assert_eq!(store.count_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_overwrites_mutable_fields() {
        let store = InMemoryRecordStore::new();
        store.upsert_by_natural_key(&pubmed("111", "Old title")).await.unwrap();
        store.upsert_by_natural_key(&pubmed("111", "New title")).await.unwrap();

        let row = store
            .find_by_key(&NaturalKey::Pmid("111".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.record.title, "New title");
    }

    #[tokio::test]
    async fn test_pmid_match_takes_precedence_over_arxiv() {
        let store = InMemoryRecordStore::new();
        let by_pmid = store.upsert_by_natural_key(&pubmed("222", "PubMed copy")).await.unwrap();

        let mut both = arxiv("2101.00002", "Merged");
        both.ids.pmid = Some("222".to_string());
        let outcome = store.upsert_by_natural_key(&both).await.unwrap();

        assert_eq!(outcome, UpsertOutcome::Updated(by_pmid.id()));
        let row = store
            .find_by_key(&NaturalKey::ArxivId("2101.00002".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.id, by_pmid.id());
        assert_eq!(row.record.natural_key, "222");
        assert_eq!(row.record.title, "Merged");
    }

    #[tokio::test]
    async fn test_merge_rejected_when_keys_belong_to_different_rows() {
        let store = InMemoryRecordStore::new();
        store.upsert_by_natural_key(&pubmed("333", "PubMed copy")).await.unwrap();
        store.upsert_by_natural_key(&arxiv("2101.00004", "arXiv copy")).await.unwrap();

        let mut both = arxiv("2101.00004", "Merged");
        both.ids.pmid = Some("333".to_string());
        let outcome = store.upsert_by_natural_key(&both).await;

        assert!(matches!(outcome, Err(DbError::Duplicate(_))));
        assert_eq!(store.count_all().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_arxiv_match_when_no_pmid() {
        let store = InMemoryRecordStore::new();
        let first = store.upsert_by_natural_key(&arxiv("2101.00003", "v1")).await.unwrap();

        let mut enriched = arxiv("2101.00003", "v2");
        enriched.ids.doi = Some("10.1000/abc".to_string());
        let second = store.upsert_by_natural_key(&enriched).await.unwrap();

        assert_eq!(second, UpsertOutcome::Updated(first.id()));
        let row = store.all().await.remove(0);
        assert_eq!(row.record.ids.doi.as_deref(), Some("10.1000/abc"));
    }

    #[tokio::test]
    async fn test_pending_sync_listing() {
        let store = InMemoryRecordStore::new();
        let a = store.upsert_by_natural_key(&pubmed("1", "a")).await.unwrap().id();
        let b = store.upsert_by_natural_key(&pubmed("2", "b")).await.unwrap().id();
        assert_eq!(store.records_lacking_downstream_sync(10).await.unwrap().len(), 2);
        assert_eq!(store.records_lacking_downstream_sync(1).await.unwrap().len(), 1);

        assert_eq!(store.mark_synced(&[a, b, Uuid::new_v4()]).await.unwrap(), 2);
        assert!(store.records_lacking_downstream_sync(10).await.unwrap().is_empty());

        // An update makes the row pending again.
        store.upsert_by_natural_key(&pubmed("2", "b2")).await.unwrap();
        let pending = store.records_lacking_downstream_sync(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b);
    }

    #[tokio::test]
    async fn test_update_unknown_id_is_not_found() {
        let store = InMemoryRecordStore::new();
        let err = store.update(Uuid::new_v4(), &pubmed("9", "x")).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
    }
}
