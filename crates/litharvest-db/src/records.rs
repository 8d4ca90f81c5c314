//! PostgreSQL-backed [`RecordStore`].

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use litharvest_common::{ExternalIds, NaturalKey, PublicationDate, Record, RecordSource};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{DbError, Result};
use crate::schema::StoredRecord;
use crate::store::RecordStore;

const SELECT_COLUMNS: &str = "id, natural_key, source, pmid, arxiv_id, doi, pmc_id, title, \
     authors, abstract_text, journal, pub_date, date_precision, date_raw, subjects, \
     publication_types, full_text_url, full_text, created_at, updated_at, synced_at";

/// Row shape of the `records` table.
#[derive(Debug, FromRow)]
struct RecordRow {
    id: Uuid,
    natural_key: String,
    source: String,
    pmid: Option<String>,
    arxiv_id: Option<String>,
    doi: Option<String>,
    pmc_id: Option<String>,
    title: String,
    authors: Json<Vec<String>>,
    abstract_text: String,
    journal: Option<String>,
    pub_date: Option<NaiveDate>,
    date_precision: String,
    date_raw: Option<String>,
    subjects: Json<Vec<String>>,
    publication_types: Json<Vec<String>>,
    full_text_url: Option<String>,
    full_text: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    synced_at: Option<DateTime<Utc>>,
}

impl TryFrom<RecordRow> for StoredRecord {
    type Error = DbError;

    fn try_from(row: RecordRow) -> Result<Self> {
        let source = RecordSource::parse(&row.source)
            .ok_or_else(|| DbError::InvalidRecord(format!("unknown source '{}'", row.source)))?;
        let published = PublicationDate::from_columns(row.pub_date, &row.date_precision, row.date_raw);

        Ok(StoredRecord {
            id: row.id,
            record: Record {
                source,
                natural_key: row.natural_key,
                title: row.title,
                authors: row.authors.0,
                abstract_text: row.abstract_text,
                published,
                journal: row.journal,
                ids: ExternalIds {
                    pmid: row.pmid,
                    arxiv_id: row.arxiv_id,
                    doi: row.doi,
                    pmc_id: row.pmc_id,
                },
                subjects: row.subjects.0,
                publication_types: row.publication_types.0,
                full_text_url: row.full_text_url,
                full_text: row.full_text,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
            synced_at: row.synced_at,
        })
    }
}

/// Unique-constraint violations surface as [`DbError::Duplicate`].
fn classify(err: sqlx::Error, key: &str) -> DbError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            DbError::Duplicate(format!("{key} ({})", db.constraint().unwrap_or("unique")))
        }
        _ => DbError::Postgres(err),
    }
}

/// Repository for harvested records in PostgreSQL.
#[derive(Clone)]
pub struct PgRecordRepository {
    pool: PgPool,
}

impl PgRecordRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for PgRecordRepository {
    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<StoredRecord>> {
        // `column()` is one of two fixed identifiers, never user input.
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM records WHERE {} = $1 LIMIT 1",
            key.column()
        );
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(key.value())
            .fetch_optional(&self.pool)
            .await?;
        row.map(StoredRecord::try_from).transpose()
    }

    async fn insert(&self, record: &Record) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO records
                (id, natural_key, source, pmid, arxiv_id, doi, pmc_id, title, authors,
                 abstract_text, journal, pub_date, date_precision, date_raw, subjects,
                 publication_types, full_text_url, full_text)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18)
            "#,
        )
        .bind(id)
        .bind(&record.natural_key)
        .bind(record.source.as_str())
        .bind(&record.ids.pmid)
        .bind(&record.ids.arxiv_id)
        .bind(&record.ids.doi)
        .bind(&record.ids.pmc_id)
        .bind(&record.title)
        .bind(Json(&record.authors))
        .bind(&record.abstract_text)
        .bind(&record.journal)
        .bind(record.published.earliest_day())
        .bind(record.published.precision())
        .bind(record.published.raw())
        .bind(Json(&record.subjects))
        .bind(Json(&record.publication_types))
        .bind(&record.full_text_url)
        .bind(&record.full_text)
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, &record.natural_key))?;
        Ok(id)
    }

    async fn update(&self, id: Uuid, record: &Record) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE records SET
                pmid = $2, arxiv_id = $3, doi = $4, pmc_id = $5, title = $6,
                authors = $7, abstract_text = $8, journal = $9, pub_date = $10,
                date_precision = $11, date_raw = $12, subjects = $13,
                publication_types = $14, full_text_url = $15, full_text = $16,
                updated_at = now(), synced_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&record.ids.pmid)
        .bind(&record.ids.arxiv_id)
        .bind(&record.ids.doi)
        .bind(&record.ids.pmc_id)
        .bind(&record.title)
        .bind(Json(&record.authors))
        .bind(&record.abstract_text)
        .bind(&record.journal)
        .bind(record.published.earliest_day())
        .bind(record.published.precision())
        .bind(record.published.raw())
        .bind(Json(&record.subjects))
        .bind(Json(&record.publication_types))
        .bind(&record.full_text_url)
        .bind(&record.full_text)
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, &record.natural_key))?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn count_all(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn records_lacking_downstream_sync(&self, limit: usize) -> Result<Vec<StoredRecord>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM records \
             WHERE synced_at IS NULL OR synced_at < updated_at \
             ORDER BY updated_at LIMIT $1"
        );
        let rows: Vec<RecordRow> = sqlx::query_as(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(StoredRecord::try_from).collect()
    }

    async fn mark_synced(&self, ids: &[Uuid]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE records SET synced_at = GREATEST(now(), updated_at) WHERE id = ANY($1)",
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row(source: &str, precision: &str, pub_date: Option<NaiveDate>) -> RecordRow {
        let now = Utc::now();
        RecordRow {
            id: Uuid::new_v4(),
            natural_key: "31452104".to_string(),
            source: source.to_string(),
            pmid: Some("31452104".to_string()),
            arxiv_id: None,
            doi: Some("10.1038/s41586-019-1234-5".to_string()),
            pmc_id: None,
            title: "Title".to_string(),
            authors: Json(vec!["Jane Doe".to_string()]),
            abstract_text: String::new(),
            journal: Some("Nature".to_string()),
            pub_date,
            date_precision: precision.to_string(),
            date_raw: Some("2019 Spring".to_string()),
            subjects: Json(vec![]),
            publication_types: Json(vec!["Journal Article".to_string()]),
            full_text_url: None,
            full_text: None,
            created_at: now,
            updated_at: now,
            synced_at: None,
        }
    }

    #[test]
    fn test_row_conversion() {
        let stored = StoredRecord::try_from(row("pubmed", "month", NaiveDate::from_ymd_opt(2019, 3, 1)))
            .unwrap();
        assert_eq!(stored.record.source, RecordSource::PubMed);
        assert_eq!(stored.record.published, PublicationDate::Month { year: 2019, month: 3 });
        assert_eq!(stored.record.authors, vec!["Jane Doe".to_string()]);
        assert!(stored.needs_sync());
    }

    #[test]
    fn test_row_with_unresolved_date_keeps_raw_text() {
        let stored = StoredRecord::try_from(row("pubmed", "unresolved", None)).unwrap();
        assert_eq!(
            stored.record.published,
            PublicationDate::Unresolved { raw: Some("2019 Spring".to_string()) }
        );
    }

    #[test]
    fn test_row_with_unknown_source_is_rejected() {
        let err = StoredRecord::try_from(row("crossref", "year", None)).unwrap_err();
        assert!(matches!(err, DbError::InvalidRecord(_)));
    }
}
