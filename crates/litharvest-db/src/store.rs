//! The storage seam used by the ingestion pipeline.

use async_trait::async_trait;
use litharvest_common::{NaturalKey, Record};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::schema::StoredRecord;

/// Whether an upsert created a new row or merged into an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(Uuid),
    Updated(Uuid),
}

impl UpsertOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) => *id,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted(_))
    }
}

/// Durable record storage keyed by natural identifier.
///
/// Implementors provide the primitives; `upsert_by_natural_key` is built on
/// top of them so that every backend applies the same matching rules.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Look up a row by PMID or arXiv ID.
    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<StoredRecord>>;

    async fn insert(&self, record: &Record) -> Result<Uuid>;

    /// Replace the content of row `id`. Clears the downstream-sync marker.
    async fn update(&self, id: Uuid, record: &Record) -> Result<()>;

    async fn count_all(&self) -> Result<u64>;

    /// Rows never handed to the downstream indexer, or changed since.
    async fn records_lacking_downstream_sync(&self, limit: usize) -> Result<Vec<StoredRecord>>;

    /// Stamp rows as synced. Returns how many rows were touched.
    async fn mark_synced(&self, ids: &[Uuid]) -> Result<usize>;

    /// Insert `record`, or merge it into the row that already carries its
    /// PMID (checked first) or arXiv ID.
    async fn upsert_by_natural_key(&self, record: &Record) -> Result<UpsertOutcome> {
        for key in record.lookup_keys() {
            if let Some(existing) = self.find_by_key(&key).await? {
                let mut merged = existing.record.clone();
                merged.merge_from(record);
                self.update(existing.id, &merged).await?;
                debug!(id = %existing.id, key = key.value(), "Updated existing record");
                return Ok(UpsertOutcome::Updated(existing.id));
            }
        }

        let id = self.insert(record).await?;
        debug!(id = %id, key = %record.natural_key, "Inserted new record");
        Ok(UpsertOutcome::Inserted(id))
    }
}
