//! litharvest-ingestion — Bulk bibliographic metadata harvesting.
//! Covers:
//! - Provider clients (PubMed E-utilities, arXiv Atom API)
//! - Retry with backoff and per-provider request spacing
//! - Date-window planning and paged ingestion
//! - In-run deduplication and natural-key upsert
//! - Progress accounting toward a target record count

pub mod dates;
pub mod dedup;
pub mod ingestor;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod rate_limit;
pub mod retry;
pub mod sources;
pub mod window;

pub use dedup::DedupUpsertStore;
pub use ingestor::{IngestSettings, WindowExit, WindowIngestor};
pub use models::{BatchResult, DateRange, FetchOutcome, FullTextLookup, MalformedEntry, SearchPage, SearchRequest, SortOrder};
pub use pipeline::{run_pipeline, run_pipeline_with_progress, HarvestJob, HarvestProgress, PipelineFailure};
pub use progress::{ProgressAggregator, RunSummary};
pub use rate_limit::RateLimiter;
pub use retry::{with_retry, RetryPolicy};
pub use sources::arxiv::{ArxivClient, ArxivSettings};
pub use sources::pubmed::{PubMedClient, PubMedSettings};
pub use sources::MetadataSource;
pub use window::{plan_windows, Window, WindowOrder, WindowSpan, WindowStatus};
