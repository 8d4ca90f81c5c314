//! litharvest Database Layer
//!
//! Durable storage for harvested bibliographic records, keyed by natural
//! identifier. The [`RecordStore`] trait is the seam the ingestion pipeline
//! talks to; two implementations are provided:
//!
//! - [`PgRecordRepository`]: PostgreSQL via `sqlx`
//! - [`InMemoryRecordStore`]: process-local, for tests and dry runs
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use litharvest_db::{Database, PgRecordRepository, RecordStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/litharvest", 5).await?;
//!     db.initialize().await?;
//!
//!     let store: Arc<dyn RecordStore> = Arc::new(PgRecordRepository::new(db.pool().clone()));
//!     println!("{} records stored", store.count_all().await?);
//!     Ok(())
//! }
//! ```

pub mod database;
pub mod error;
pub mod memory;
pub mod records;
pub mod schema;
pub mod store;

pub use database::{Database, DatabaseStats};
pub use error::{DbError, Result};
pub use memory::InMemoryRecordStore;
pub use records::PgRecordRepository;
pub use schema::{StoredRecord, TABLE_RECORDS};
pub use store::{RecordStore, UpsertOutcome};
