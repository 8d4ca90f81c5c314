//! Run-scoped duplicate filter in front of the record store.

use std::collections::HashSet;
use std::sync::Arc;

use litharvest_common::{Record, Result};
use litharvest_db::{RecordStore, UpsertOutcome};

/// Wraps a [`RecordStore`] with the set of natural keys already stored
/// during this run, so a key that shows up again in a later page or window
/// is dropped before it is fetched. The set is not persisted.
pub struct DedupUpsertStore {
    store: Arc<dyn RecordStore>,
    seen: HashSet<String>,
}

impl DedupUpsertStore {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store, seen: HashSet::new() }
    }

    /// Keys not yet processed this run, in input order, and how many were
    /// dropped (including repeats within `keys`).
    pub fn filter_unseen(&self, keys: &[String]) -> (Vec<String>, usize) {
        let mut page = HashSet::with_capacity(keys.len());
        let unseen: Vec<String> = keys
            .iter()
            .filter(|k| !self.seen.contains(k.as_str()) && page.insert(k.as_str()))
            .cloned()
            .collect();
        let skipped = keys.len() - unseen.len();
        (unseen, skipped)
    }

    pub fn is_seen(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Insert or merge `record`. The key counts as processed only once the
    /// store accepted it.
    pub async fn upsert(&mut self, record: &Record) -> Result<UpsertOutcome> {
        let outcome = self.store.upsert_by_natural_key(record).await?;
        self.seen.insert(record.natural_key.clone());
        Ok(outcome)
    }

    pub async fn count_all(&self) -> Result<u64> {
        Ok(self.store.count_all().await?)
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }
}
