//! Connection pool and schema management.

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::error::Result;
use crate::schema::SCHEMA_STATEMENTS;

/// Main database handle.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL at `url`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they don't exist.
    pub async fn initialize(&self) -> Result<()> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Database schema ready");
        Ok(())
    }

    /// Get database statistics.
    pub async fn stats(&self) -> Result<DatabaseStats> {
        let (records, pending_sync, unresolved_dates): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE synced_at IS NULL OR synced_at < updated_at),
                COUNT(*) FILTER (WHERE date_precision = 'unresolved')
            FROM records
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DatabaseStats {
            records: records as u64,
            pending_sync: pending_sync as u64,
            unresolved_dates: unresolved_dates as u64,
        })
    }
}

/// Database statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStats {
    pub records: u64,
    pub pending_sync: u64,
    pub unresolved_dates: u64,
}
