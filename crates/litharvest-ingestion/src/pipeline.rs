//! Bulk harvest pipeline.
//!
//! Orchestrates one run:
//!   1. Read the stored count and stop early if the target is already met
//!   2. Split the date range into windows
//!   3. For each query in turn, page through every window
//!      (search → dedup → fetch → upsert)
//!   4. Stop on target, cancellation or a fatal error
//!
//! The run always yields a [`RunSummary`], including when it fails.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use litharvest_common::HarvestError;
use litharvest_db::RecordStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::dedup::DedupUpsertStore;
use crate::ingestor::{IngestSettings, WindowExit, WindowIngestor};
use crate::models::{DateRange, SortOrder};
use crate::progress::{ProgressAggregator, RunSummary};
use crate::sources::MetadataSource;
use crate::window::{plan_windows, WindowOrder, WindowSpan, WindowStatus};

// ── Job config ────────────────────────────────────────────────────────────────

/// Parameters for a single harvest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestJob {
    /// Stop once the store holds this many records.
    pub target: u64,
    pub batch_size: usize,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Provider queries, run in order until the target is met. Empty runs
    /// once with the client's default query.
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default)]
    pub span: WindowSpan,
    #[serde(default)]
    pub order: WindowOrder,
    #[serde(default)]
    pub sort: SortOrder,
    pub max_consecutive_failures: u32,
    pub pacing_delay_ms: u64,
    /// Attempt full-text enrichment for every stored record.
    #[serde(default)]
    pub enrich_full_text: bool,
}

impl Default for HarvestJob {
    fn default() -> Self {
        let today = chrono::Utc::now().date_naive();
        Self {
            target: 1_000,
            batch_size: 100,
            start_date: today - chrono::Days::new(365),
            end_date: today,
            queries: Vec::new(),
            span: WindowSpan::default(),
            order: WindowOrder::default(),
            sort: SortOrder::default(),
            max_consecutive_failures: 5,
            pacing_delay_ms: 2_000,
            enrich_full_text: false,
        }
    }
}

impl HarvestJob {
    pub fn date_range(&self) -> DateRange {
        DateRange::new(self.start_date, self.end_date)
    }

    pub fn validate(&self) -> Result<(), HarvestError> {
        if self.batch_size == 0 {
            return Err(HarvestError::Config("batch size must be at least 1".to_string()));
        }
        if self.start_date > self.end_date {
            return Err(HarvestError::Config(format!(
                "start date {} is after end date {}",
                self.start_date, self.end_date
            )));
        }
        Ok(())
    }

    /// Queries to run, with the empty default query standing in for none.
    fn query_list(&self) -> Vec<&str> {
        if self.queries.is_empty() {
            vec![""]
        } else {
            self.queries.iter().map(String::as_str).collect()
        }
    }

    fn ingest_settings(&self, query: &str) -> IngestSettings {
        IngestSettings {
            query: query.to_string(),
            batch_size: self.batch_size,
            sort: self.sort,
            max_consecutive_failures: self.max_consecutive_failures,
            pacing_delay: Duration::from_millis(self.pacing_delay_ms),
            enrich_full_text: self.enrich_full_text,
        }
    }
}

// ── Progress events ───────────────────────────────────────────────────────────

/// Emitted after every window (cloneable for broadcast).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestProgress {
    pub run_id: Uuid,
    pub query: String,
    pub window: String,
    pub status: WindowStatus,
    pub current_total: u64,
    pub target: u64,
}

// ── Failure ───────────────────────────────────────────────────────────────────

/// A run stopped by a fatal error, with everything it did before stopping.
#[derive(Debug, Error)]
#[error("harvest run {} failed: {error}", .summary.run_id)]
pub struct PipelineFailure {
    pub summary: RunSummary,
    #[source]
    pub error: HarvestError,
}

// ── Pipeline orchestrator ─────────────────────────────────────────────────────

pub async fn run_pipeline(
    job: &HarvestJob,
    source: &dyn MetadataSource,
    store: Arc<dyn RecordStore>,
    cancel: CancellationToken,
) -> Result<RunSummary, PipelineFailure> {
    run_pipeline_with_progress(job, source, store, cancel, None).await
}

/// Runs one harvest job against `source`, storing into `store`.
///
/// Non-fatal errors are logged, counted and skipped past. Configuration,
/// sandbox and unclassified errors stop the run and are returned with the
/// partial summary.
#[instrument(skip_all, fields(source = source.name(), target = job.target))]
pub async fn run_pipeline_with_progress(
    job: &HarvestJob,
    source: &dyn MetadataSource,
    store: Arc<dyn RecordStore>,
    cancel: CancellationToken,
    progress_tx: Option<broadcast::Sender<HarvestProgress>>,
) -> Result<RunSummary, PipelineFailure> {
    let run_id = Uuid::new_v4();
    let fail = |progress: &ProgressAggregator, error: HarvestError| {
        error!(run_id = %run_id, error = %error, "Harvest run failed");
        PipelineFailure { summary: progress.summary(), error }
    };

    let mut dedup = DedupUpsertStore::new(store);
    let initial_total = match dedup.count_all().await {
        Ok(n) => n,
        Err(e) => {
            let progress = ProgressAggregator::new(run_id, source.name(), job.target, 0);
            return Err(fail(&progress, e));
        }
    };
    let mut progress = ProgressAggregator::new(run_id, source.name(), job.target, initial_total);

    if let Err(e) = job.validate() {
        return Err(fail(&progress, e));
    }

    info!(
        run_id = %run_id,
        range = %job.date_range(),
        span = %job.span,
        batch_size = job.batch_size,
        initial_total,
        "Starting harvest run"
    );

    if !progress.should_continue() {
        info!(run_id = %run_id, initial_total, target = job.target, "Store already at target, nothing to do");
        return Ok(progress.summary());
    }

    let planned = match plan_windows(job.date_range(), job.span, job.order) {
        Ok(w) => w,
        Err(e) => return Err(fail(&progress, e)),
    };
    let queries = job.query_list();
    progress.record_windows_planned(planned.len() * queries.len());
    info!(
        run_id = %run_id,
        windows = planned.len(),
        queries = queries.len(),
        order = ?job.order,
        "Planned windows"
    );

    // The dedup seen-set spans queries, so overlapping result sets are
    // fetched once.
    'queries: for (ix, query) in queries.iter().enumerate() {
        if !progress.should_continue() {
            break;
        }
        info!(run_id = %run_id, query, "Query {}/{}", ix + 1, queries.len());

        let settings = job.ingest_settings(query);
        let ingestor = WindowIngestor::new(source, &settings, &cancel);
        let mut windows = planned.clone();

        for window in windows.iter_mut() {
            if cancel.is_cancelled() {
                progress.mark_cancelled();
                break 'queries;
            }
            if !progress.should_continue() {
                break 'queries;
            }

            let exit = match ingestor.ingest_window(window, &mut dedup, &mut progress).await {
                Ok(exit) => exit,
                Err(e) => return Err(fail(&progress, e)),
            };
            progress.record_window(window);

            if let Some(tx) = &progress_tx {
                let _ = tx.send(HarvestProgress {
                    run_id,
                    query: query.to_string(),
                    window: window.to_string(),
                    status: window.status,
                    current_total: progress.current_total(),
                    target: job.target,
                });
            }

            match exit {
                WindowExit::Exhausted | WindowExit::Aborted => {}
                WindowExit::TargetReached => break 'queries,
                WindowExit::Cancelled => {
                    progress.mark_cancelled();
                    break 'queries;
                }
            }
        }
    }

    let summary = progress.summary();
    info!(
        run_id = %run_id,
        stored = summary.records_stored,
        updated = summary.records_updated,
        failed = summary.records_failed,
        final_total = summary.final_total,
        target_reached = summary.target_reached,
        cancelled = summary.cancelled,
        elapsed_s = summary.elapsed_seconds,
        "Harvest run finished"
    );
    Ok(summary)
}
