//! litharvest-common — Shared record types, errors, and the sandboxed HTTP
//! client used across all litharvest crates.

pub mod error;
pub mod record;
pub mod sandbox;

// Re-export commonly used types
pub use error::{HarvestError, Result};
pub use record::{ExternalIds, NaturalKey, PublicationDate, Record, RecordSource};
