//! Storage schema for harvested records.

use chrono::{DateTime, Utc};
use litharvest_common::Record;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Table Names
// =============================================================================

pub const TABLE_RECORDS: &str = "records";

// =============================================================================
// Stored Record
// =============================================================================

/// A record as persisted, with storage bookkeeping around it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: Uuid,
    pub record: Record,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last time the downstream indexer picked this row up.
    pub synced_at: Option<DateTime<Utc>>,
}

impl StoredRecord {
    pub fn new(record: Record) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            record,
            created_at: now,
            updated_at: now,
            synced_at: None,
        }
    }

    /// True when the row changed after the indexer last saw it.
    pub fn needs_sync(&self) -> bool {
        match self.synced_at {
            None => true,
            Some(synced) => synced < self.updated_at,
        }
    }
}

// =============================================================================
// DDL
// =============================================================================

/// Idempotent schema statements, run in order by `Database::initialize`.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS records (
        id                UUID PRIMARY KEY,
        natural_key       TEXT NOT NULL UNIQUE,
        source            TEXT NOT NULL,
        pmid              TEXT UNIQUE,
        arxiv_id          TEXT UNIQUE,
        doi               TEXT,
        pmc_id            TEXT,
        title             TEXT NOT NULL,
        authors           JSONB NOT NULL DEFAULT '[]',
        abstract_text     TEXT NOT NULL DEFAULT '',
        journal           TEXT,
        pub_date          DATE,
        date_precision    TEXT NOT NULL DEFAULT 'unresolved',
        date_raw          TEXT,
        subjects          JSONB NOT NULL DEFAULT '[]',
        publication_types JSONB NOT NULL DEFAULT '[]',
        full_text_url     TEXT,
        full_text         TEXT,
        created_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
        synced_at         TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_records_source ON records (source)",
    "CREATE INDEX IF NOT EXISTS idx_records_pending_sync ON records (updated_at) \
     WHERE synced_at IS NULL",
];

#[cfg(test)]
mod tests {
    use super::*;
    use litharvest_common::{ExternalIds, PublicationDate, RecordSource};

    fn record() -> Record {
        Record {
            source: RecordSource::Arxiv,
            natural_key: "2301.00001".to_string(),
            title: "Attention is all you need, again".to_string(),
            authors: vec![],
            abstract_text: String::new(),
            published: PublicationDate::Year { year: 2023 },
            journal: None,
            ids: ExternalIds { arxiv_id: Some("2301.00001".to_string()), ..Default::default() },
            subjects: vec![],
            publication_types: vec![],
            full_text_url: None,
            full_text: None,
        }
    }

    #[test]
    fn test_new_record_needs_sync() {
        let mut stored = StoredRecord::new(record());
        assert!(stored.needs_sync());

        stored.synced_at = Some(stored.updated_at);
        assert!(!stored.needs_sync());

        stored.updated_at = stored.updated_at + chrono::Duration::seconds(1);
        assert!(stored.needs_sync());
    }
}
