//! Data models shared by the source clients and the window loop.

use chrono::NaiveDate;
use litharvest_common::{HarvestError, Record};
use serde::{Deserialize, Serialize};

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Result ordering requested from the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Relevance,
    /// Publication (PubMed) or submission (arXiv) date, newest first.
    #[default]
    Date,
}

impl SortOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relevance" => Some(SortOrder::Relevance),
            "date" | "pub_date" | "submitted_date" | "submitteddate" => Some(SortOrder::Date),
            _ => None,
        }
    }
}

/// One page of a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub max_results: usize,
    pub start_offset: usize,
    pub date_range: Option<DateRange>,
    pub sort: SortOrder,
}

/// One page of search results.
///
/// `returned` counts every entry the provider sent, including the ones in
/// `malformed` that never got a key. Paging advances by `returned`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    pub keys: Vec<String>,
    pub returned: usize,
    pub malformed: Vec<MalformedEntry>,
}

impl SearchPage {
    pub fn from_keys(keys: Vec<String>) -> Self {
        Self { returned: keys.len(), keys, malformed: Vec::new() }
    }
}

/// A fetched entry that could not be turned into a [`Record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedEntry {
    /// Natural key, when the entry got far enough to have one.
    pub key: Option<String>,
    pub reason: String,
}

/// Records parsed from one fetch, plus the entries that were dropped.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub records: Vec<Record>,
    pub malformed: Vec<MalformedEntry>,
}

impl FetchOutcome {
    pub fn extend(&mut self, other: FetchOutcome) {
        self.records.extend(other.records);
        self.malformed.extend(other.malformed);
    }
}

/// Result of a best-effort full-text lookup.
#[derive(Debug)]
pub enum FullTextLookup {
    Found(String),
    /// The provider has no full text for this record (404/403, error body,
    /// missing identifier, or no enrichment support).
    NotAvailable,
    Failed(HarvestError),
}

/// Upper bound on error summaries kept per batch.
pub const MAX_BATCH_ERRORS: usize = 10;

/// Statistics for one search→fetch→store round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    /// Entries returned by search, keyed or not.
    pub page_len: usize,
    pub fetched: usize,
    pub stored: usize,
    pub updated: usize,
    pub failed: usize,
    pub duplicates_skipped: usize,
    pub date_unresolved: usize,
    pub full_texts_found: usize,
    pub errors: Vec<String>,
}

impl BatchResult {
    pub fn push_error(&mut self, message: impl Into<String>) {
        if self.errors.len() < MAX_BATCH_ERRORS {
            self.errors.push(message.into());
        }
    }
}
