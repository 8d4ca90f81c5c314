//! Paging through one date window.
//!
//! Per window: `pending → active → {exhausted | aborted}`. Each iteration
//! searches one page at the window's offset, drops keys already handled this
//! run, fetches the rest, upserts them and reports the batch to the
//! [`ProgressAggregator`]. Failed pages are skipped rather than retried
//! forever; too many in a row abort the window. Only fatal errors leave
//! the loop as `Err`.

use std::time::Duration;

use litharvest_common::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dedup::DedupUpsertStore;
use crate::models::{BatchResult, FullTextLookup, SearchRequest, SortOrder};
use crate::progress::ProgressAggregator;
use crate::sources::MetadataSource;
use crate::window::{Window, WindowStatus};

/// Loop parameters shared by every window of a run.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub query: String,
    pub batch_size: usize,
    pub sort: SortOrder,
    pub max_consecutive_failures: u32,
    /// Courtesy pause between pages, on top of the rate limiter.
    pub pacing_delay: Duration,
    pub enrich_full_text: bool,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            query: String::new(),
            batch_size: 100,
            sort: SortOrder::Date,
            max_consecutive_failures: 5,
            pacing_delay: Duration::from_secs(2),
            enrich_full_text: false,
        }
    }
}

/// Why a window stopped being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowExit {
    Exhausted,
    Aborted,
    /// The run's target was met; no further windows are needed.
    TargetReached,
    Cancelled,
}

pub struct WindowIngestor<'a> {
    source: &'a dyn MetadataSource,
    settings: &'a IngestSettings,
    cancel: &'a CancellationToken,
}

impl<'a> WindowIngestor<'a> {
    pub fn new(source: &'a dyn MetadataSource, settings: &'a IngestSettings, cancel: &'a CancellationToken) -> Self {
        Self { source, settings, cancel }
    }

    /// Batch size cut down to what the source serves in one page, so a
    /// full provider page is never mistaken for a short one.
    fn page_size(&self) -> usize {
        self.settings.batch_size.min(self.source.max_page_size()).max(1)
    }

    /// Page through `window` until it is exhausted or aborted, the target is
    /// reached, or the run is cancelled.
    pub async fn ingest_window(
        &self,
        window: &mut Window,
        dedup: &mut DedupUpsertStore,
        progress: &mut ProgressAggregator,
    ) -> Result<WindowExit> {
        window.activate();
        let page_size = self.page_size();
        info!(window = %window, source = self.source.name(), page_size, "Window started");

        loop {
            if self.cancel.is_cancelled() {
                info!(window = %window, offset = window.offset, "Cancelled");
                return Ok(WindowExit::Cancelled);
            }

            let batch_limit = progress.batch_limit(page_size);
            if batch_limit == 0 {
                return Ok(WindowExit::TargetReached);
            }

            match self.run_batch(window, batch_limit, dedup).await {
                Ok(batch) => {
                    window.consecutive_failures = 0;
                    progress.record_batch(&batch);
                    info!(
                        window = %window,
                        offset = window.offset,
                        batch_limit,
                        page = batch.page_len,
                        stored = batch.stored,
                        updated = batch.updated,
                        failed = batch.failed,
                        skipped = batch.duplicates_skipped,
                        total = progress.current_total(),
                        "Batch complete"
                    );
                    window.offset += batch.page_len;

                    if batch.page_len == 0 || batch.page_len < batch_limit {
                        window.status = WindowStatus::Exhausted;
                        debug!(window = %window, "Window exhausted");
                        return Ok(WindowExit::Exhausted);
                    }
                    if !progress.should_continue() {
                        return Ok(WindowExit::TargetReached);
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(window = %window, offset = window.offset, error = %e, "Fatal error, stopping run");
                    return Err(e);
                }
                Err(e) => {
                    window.consecutive_failures += 1;
                    warn!(
                        window = %window,
                        offset = window.offset,
                        failures = window.consecutive_failures,
                        error = %e,
                        "Batch failed, skipping ahead"
                    );
                    progress.record_failed_batch(&format!("{window} offset {}: {e}", window.offset));
                    window.offset += page_size;

                    if window.consecutive_failures >= self.settings.max_consecutive_failures.max(1) {
                        window.status = WindowStatus::Aborted;
                        warn!(window = %window, "Too many consecutive failures, aborting window");
                        return Ok(WindowExit::Aborted);
                    }
                }
            }

            if !self.settings.pacing_delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        info!(window = %window, offset = window.offset, "Cancelled during pacing delay");
                        return Ok(WindowExit::Cancelled);
                    }
                    _ = tokio::time::sleep(self.settings.pacing_delay) => {}
                }
            }
        }
    }

    /// One search → fetch → store round. Per-record problems are counted in
    /// the batch; only search or fetch failures come back as `Err`.
    async fn run_batch(
        &self,
        window: &Window,
        batch_limit: usize,
        dedup: &mut DedupUpsertStore,
    ) -> Result<BatchResult> {
        let request = SearchRequest {
            query: self.settings.query.clone(),
            max_results: batch_limit,
            start_offset: window.offset,
            date_range: Some(window.range),
            sort: self.settings.sort,
        };
        let page = self.source.search(&request).await?;

        let mut batch = BatchResult { page_len: page.returned, ..Default::default() };
        batch.failed = page.malformed.len();
        for m in &page.malformed {
            batch.push_error(format!("{}: {}", m.key.as_deref().unwrap_or("<no key>"), m.reason));
        }

        let (unseen, skipped) = dedup.filter_unseen(&page.keys);
        batch.duplicates_skipped = skipped;
        if unseen.is_empty() {
            return Ok(batch);
        }

        let outcome = self.source.fetch(&unseen).await?;
        batch.fetched = outcome.records.len();
        batch.failed += outcome.malformed.len();
        for m in &outcome.malformed {
            batch.push_error(format!("{}: {}", m.key.as_deref().unwrap_or("<no key>"), m.reason));
        }

        for mut record in outcome.records {
            if !record.published.is_resolved() {
                batch.date_unresolved += 1;
            }

            if self.settings.enrich_full_text {
                match self.source.fetch_full_text(&record).await {
                    FullTextLookup::Found(text) => {
                        record.full_text = Some(text);
                        batch.full_texts_found += 1;
                    }
                    FullTextLookup::NotAvailable => {}
                    FullTextLookup::Failed(e) => {
                        warn!(key = %record.natural_key, error = %e, "Full-text lookup failed");
                        batch.push_error(format!("{}: full text: {e}", record.natural_key));
                    }
                }
            }

            match dedup.upsert(&record).await {
                Ok(outcome) if outcome.is_insert() => batch.stored += 1,
                Ok(_) => batch.updated += 1,
                Err(e) => {
                    warn!(key = %record.natural_key, error = %e, "Upsert failed");
                    batch.failed += 1;
                    batch.push_error(format!("{}: {e}", record.natural_key));
                }
            }
        }

        Ok(batch)
    }
}
