//! Run-wide progress accounting.
//!
//! [`ProgressAggregator`] is the only place that decides whether the run
//! has reached its target.

use serde::Serialize;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::models::{BatchResult, MAX_BATCH_ERRORS};
use crate::window::{Window, WindowStatus};

/// Final report of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source: String,
    pub target: u64,
    pub initial_total: u64,
    pub final_total: u64,
    pub records_fetched: u64,
    pub records_stored: u64,
    pub records_updated: u64,
    pub records_failed: u64,
    pub duplicates_skipped: u64,
    pub records_date_unresolved: u64,
    pub full_texts_found: u64,
    pub batches_processed: u64,
    pub batches_failed: u64,
    pub windows_planned: u64,
    pub windows_exhausted: u64,
    pub windows_aborted: u64,
    pub target_reached: bool,
    pub cancelled: bool,
    pub elapsed_seconds: f64,
    /// First few error messages seen during the run.
    pub errors: Vec<String>,
}

/// Progress toward the target for one run.
#[derive(Debug)]
pub struct ProgressAggregator {
    summary: RunSummary,
    started: Instant,
}

impl ProgressAggregator {
    /// `initial_total` is the store's count when the run starts.
    pub fn new(run_id: Uuid, source: &str, target: u64, initial_total: u64) -> Self {
        Self {
            summary: RunSummary {
                run_id,
                source: source.to_string(),
                target,
                initial_total,
                final_total: initial_total,
                ..Default::default()
            },
            started: Instant::now(),
        }
    }

    pub fn target(&self) -> u64 {
        self.summary.target
    }

    /// Stored count at run start plus records newly inserted since.
    pub fn current_total(&self) -> u64 {
        self.summary.initial_total + self.summary.records_stored
    }

    pub fn should_continue(&self) -> bool {
        self.current_total() < self.summary.target
    }

    /// `min(batch_size, target - current_total)`; 0 once the target is met.
    pub fn batch_limit(&self, batch_size: usize) -> usize {
        let remaining = self.summary.target.saturating_sub(self.current_total());
        usize::try_from(remaining).map_or(batch_size, |r| r.min(batch_size))
    }

    pub fn record_batch(&mut self, batch: &BatchResult) {
        let s = &mut self.summary;
        s.batches_processed += 1;
        s.records_fetched += batch.fetched as u64;
        s.records_stored += batch.stored as u64;
        s.records_updated += batch.updated as u64;
        s.records_failed += batch.failed as u64;
        s.duplicates_skipped += batch.duplicates_skipped as u64;
        s.records_date_unresolved += batch.date_unresolved as u64;
        s.full_texts_found += batch.full_texts_found as u64;
        for e in &batch.errors {
            self.push_error(e.clone());
        }
    }

    /// A batch that produced nothing because search or fetch failed.
    pub fn record_failed_batch(&mut self, error: &str) {
        self.summary.batches_failed += 1;
        self.push_error(error.to_string());
    }

    pub fn record_windows_planned(&mut self, count: usize) {
        self.summary.windows_planned = count as u64;
    }

    /// Tally a finished window and log overall progress.
    pub fn record_window(&mut self, window: &Window) {
        match window.status {
            WindowStatus::Exhausted => self.summary.windows_exhausted += 1,
            WindowStatus::Aborted => self.summary.windows_aborted += 1,
            WindowStatus::Pending | WindowStatus::Active => {}
        }
        let current = self.current_total();
        let target = self.summary.target;
        let pct = if target == 0 { 100.0 } else { current as f64 * 100.0 / target as f64 };
        info!(window = %window, status = ?window.status, "Progress: {current}/{target} ({pct:.1}%)");
    }

    pub fn mark_cancelled(&mut self) {
        self.summary.cancelled = true;
    }

    fn push_error(&mut self, message: String) {
        if self.summary.errors.len() < MAX_BATCH_ERRORS {
            self.summary.errors.push(message);
        }
    }

    pub fn summary(&self) -> RunSummary {
        let mut s = self.summary.clone();
        s.final_total = self.current_total();
        s.target_reached = !self.should_continue();
        s.elapsed_seconds = self.started.elapsed().as_secs_f64();
        s
    }
}
