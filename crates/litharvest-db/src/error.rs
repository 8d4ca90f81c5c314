//! Database error types.

use litharvest_common::HarvestError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate entry: {0}")]
    Duplicate(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Database not initialized")]
    NotInitialized,
}

impl From<DbError> for HarvestError {
    fn from(err: DbError) -> Self {
        HarvestError::Storage(err.to_string())
    }
}
