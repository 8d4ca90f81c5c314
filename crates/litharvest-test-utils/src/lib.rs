//! Shared fixtures for litharvest tests.
//!
//! [`FakeSource`] serves a fixed corpus through the [`MetadataSource`]
//! interface, paging by offset and filtering by the requested date range
//! the way the real providers do. Entries can be tied to one query, pages
//! can be capped like a provider's maximum page, failures are injected with
//! hooks, and every call is logged for assertions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::NaiveDate;
use litharvest_common::{ExternalIds, HarvestError, NaturalKey, PublicationDate, Record, RecordSource, Result};
use litharvest_db::{DbError, InMemoryRecordStore, RecordStore, StoredRecord};
use litharvest_ingestion::models::{FetchOutcome, FullTextLookup, MalformedEntry, SearchPage, SearchRequest};
use litharvest_ingestion::window::WindowSpan;
use litharvest_ingestion::{HarvestJob, MetadataSource, WindowOrder};
use uuid::Uuid;

// ── Builders ──────────────────────────────────────────────────────────────────

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid calendar date")
}

pub fn pubmed_record(pmid: &str, published: NaiveDate) -> Record {
    Record {
        source: RecordSource::PubMed,
        natural_key: pmid.to_string(),
        title: format!("Article {pmid}"),
        authors: vec!["Jane Doe".to_string(), "Wei Zhang".to_string()],
        abstract_text: format!("Abstract of article {pmid}."),
        published: PublicationDate::Day { date: published },
        journal: Some("Journal of Testing".to_string()),
        ids: ExternalIds { pmid: Some(pmid.to_string()), ..Default::default() },
        subjects: vec!["Humans".to_string()],
        publication_types: vec!["Journal Article".to_string()],
        full_text_url: None,
        full_text: None,
    }
}

pub fn arxiv_record(id: &str, published: NaiveDate) -> Record {
    Record {
        source: RecordSource::Arxiv,
        natural_key: id.to_string(),
        title: format!("Preprint {id}"),
        authors: vec!["Ada Lovelace".to_string()],
        abstract_text: format!("Abstract of preprint {id}."),
        published: PublicationDate::Day { date: published },
        journal: None,
        ids: ExternalIds { arxiv_id: Some(id.to_string()), ..Default::default() },
        subjects: vec!["cs.LG".to_string()],
        publication_types: vec![],
        full_text_url: Some(format!("https://arxiv.org/pdf/{id}")),
        full_text: None,
    }
}

/// `count` PubMed records with consecutive PMIDs from `first_pmid`, all
/// published on `published`.
pub fn pubmed_records(first_pmid: u32, count: u32, published: NaiveDate) -> Vec<Record> {
    (first_pmid..first_pmid + count)
        .map(|pmid| pubmed_record(&pmid.to_string(), published))
        .collect()
}

/// A job with no pacing delay, one-month windows, oldest window first.
pub fn fast_job(target: u64, batch_size: usize, start: NaiveDate, end: NaiveDate) -> HarvestJob {
    HarvestJob {
        target,
        batch_size,
        start_date: start,
        end_date: end,
        queries: Vec::new(),
        span: WindowSpan::Months(1),
        order: WindowOrder::Chronological,
        max_consecutive_failures: 3,
        pacing_delay_ms: 0,
        ..HarvestJob::default()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── FakeSource ────────────────────────────────────────────────────────────────

pub type SearchHook = Box<dyn Fn(&SearchRequest) -> Option<HarvestError> + Send + Sync>;
pub type FetchHook = Box<dyn Fn(&[String]) -> Option<HarvestError> + Send + Sync>;

struct Entry {
    /// `None` for an entry search returns without a usable id.
    key: Option<String>,
    date: NaiveDate,
    /// `None` for an entry the fetch reports as malformed.
    record: Option<Record>,
    /// Only returned by searches for this query.
    query: Option<String>,
}

impl Entry {
    fn matches(&self, request: &SearchRequest) -> bool {
        request.date_range.map_or(true, |r| r.contains(self.date))
            && self.query.as_deref().map_or(true, |q| q == request.query)
    }
}

pub struct FakeSource {
    name: &'static str,
    entries: Vec<Entry>,
    page_cap: Option<usize>,
    full_texts: HashMap<String, String>,
    search_hook: Option<SearchHook>,
    fetch_hook: Option<FetchHook>,
    searches: Mutex<Vec<SearchRequest>>,
    fetches: Mutex<Vec<Vec<String>>>,
    full_text_lookups: AtomicUsize,
}

impl FakeSource {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Vec::new(),
            page_cap: None,
            full_texts: HashMap::new(),
            search_hook: None,
            fetch_hook: None,
            searches: Mutex::new(Vec::new()),
            fetches: Mutex::new(Vec::new()),
            full_text_lookups: AtomicUsize::new(0),
        }
    }

    /// Add a record, searchable on the first day of its publication date.
    pub fn with_record(mut self, record: Record) -> Self {
        let date = record
            .published
            .earliest_day()
            .expect("fixture records need a resolved date");
        self.entries.push(Entry { key: Some(record.natural_key.clone()), date, record: Some(record), query: None });
        self
    }

    pub fn with_records(self, records: impl IntoIterator<Item = Record>) -> Self {
        records.into_iter().fold(self, FakeSource::with_record)
    }

    /// Records that only searches for `query` return.
    pub fn with_query_records(mut self, query: &str, records: impl IntoIterator<Item = Record>) -> Self {
        let start = self.entries.len();
        self = self.with_records(records);
        for entry in &mut self.entries[start..] {
            entry.query = Some(query.to_string());
        }
        self
    }

    /// A key that search returns but fetch cannot parse.
    pub fn with_malformed(mut self, key: &str, date: NaiveDate) -> Self {
        self.entries.push(Entry { key: Some(key.to_string()), date, record: None, query: None });
        self
    }

    /// An entry that search returns without an id.
    pub fn with_keyless_entry(mut self, date: NaiveDate) -> Self {
        self.entries.push(Entry { key: None, date, record: None, query: None });
        self
    }

    /// Serve at most `cap` entries per search, whatever the request asks for.
    pub fn with_page_cap(mut self, cap: usize) -> Self {
        self.page_cap = Some(cap);
        self
    }

    pub fn with_full_text(mut self, key: &str, text: &str) -> Self {
        self.full_texts.insert(key.to_string(), text.to_string());
        self
    }

    /// Fail any search for which `hook` returns an error.
    pub fn fail_search_when(
        mut self,
        hook: impl Fn(&SearchRequest) -> Option<HarvestError> + Send + Sync + 'static,
    ) -> Self {
        self.search_hook = Some(Box::new(hook));
        self
    }

    pub fn fail_fetch_when(mut self, hook: impl Fn(&[String]) -> Option<HarvestError> + Send + Sync + 'static) -> Self {
        self.fetch_hook = Some(Box::new(hook));
        self
    }

    pub fn searches(&self) -> Vec<SearchRequest> {
        lock(&self.searches).clone()
    }

    pub fn search_count(&self) -> usize {
        lock(&self.searches).len()
    }

    /// Key lists passed to each fetch call, in order.
    pub fn fetch_calls(&self) -> Vec<Vec<String>> {
        lock(&self.fetches).clone()
    }

    pub fn fetched_keys(&self) -> Vec<String> {
        lock(&self.fetches).iter().flatten().cloned().collect()
    }

    pub fn full_text_lookups(&self) -> usize {
        self.full_text_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataSource for FakeSource {
    fn name(&self) -> &'static str {
        self.name
    }

    fn max_page_size(&self) -> usize {
        self.page_cap.unwrap_or(usize::MAX)
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchPage> {
        lock(&self.searches).push(request.clone());
        if let Some(err) = self.search_hook.as_ref().and_then(|hook| hook(request)) {
            return Err(err);
        }
        let mut page = SearchPage::default();
        for entry in self
            .entries
            .iter()
            .filter(|e| e.matches(request))
            .skip(request.start_offset)
            .take(request.max_results.min(self.max_page_size()))
        {
            page.returned += 1;
            match &entry.key {
                Some(key) => page.keys.push(key.clone()),
                None => page.malformed.push(MalformedEntry { key: None, reason: "missing id".to_string() }),
            }
        }
        Ok(page)
    }

    async fn fetch(&self, keys: &[String]) -> Result<FetchOutcome> {
        lock(&self.fetches).push(keys.to_vec());
        if let Some(err) = self.fetch_hook.as_ref().and_then(|hook| hook(keys)) {
            return Err(err);
        }
        let mut outcome = FetchOutcome::default();
        for key in keys {
            match self.entries.iter().find(|e| e.key.as_ref() == Some(key)) {
                Some(Entry { record: Some(record), .. }) => outcome.records.push(record.clone()),
                Some(Entry { record: None, .. }) => outcome.malformed.push(MalformedEntry {
                    key: Some(key.clone()),
                    reason: "missing title".to_string(),
                }),
                None => outcome.malformed.push(MalformedEntry {
                    key: Some(key.clone()),
                    reason: "not returned by fetch".to_string(),
                }),
            }
        }
        Ok(outcome)
    }

    async fn fetch_full_text(&self, record: &Record) -> FullTextLookup {
        self.full_text_lookups.fetch_add(1, Ordering::SeqCst);
        match self.full_texts.get(&record.natural_key) {
            Some(text) => FullTextLookup::Found(text.clone()),
            None => FullTextLookup::NotAvailable,
        }
    }
}

// ── FlakyStore ────────────────────────────────────────────────────────────────

/// [`InMemoryRecordStore`] with switchable failures.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryRecordStore,
    fail_count: AtomicBool,
    fail_insert_keys: Mutex<HashSet<String>>,
    inserts: AtomicUsize,
    updates: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_count(&self, fail: bool) {
        self.fail_count.store(fail, Ordering::SeqCst);
    }

    /// Make inserts of these natural keys fail.
    pub fn fail_inserts_for<'a>(&self, keys: impl IntoIterator<Item = &'a str>) {
        lock(&self.fail_insert_keys).extend(keys.into_iter().map(str::to_string));
    }

    pub fn inner(&self) -> &InMemoryRecordStore {
        &self.inner
    }

    pub fn insert_calls(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn find_by_key(&self, key: &NaturalKey) -> litharvest_db::Result<Option<StoredRecord>> {
        self.inner.find_by_key(key).await
    }

    async fn insert(&self, record: &Record) -> litharvest_db::Result<Uuid> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        if lock(&self.fail_insert_keys).contains(&record.natural_key) {
            return Err(DbError::InvalidRecord(format!("injected insert failure for {}", record.natural_key)));
        }
        self.inner.insert(record).await
    }

    async fn update(&self, id: Uuid, record: &Record) -> litharvest_db::Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update(id, record).await
    }

    async fn count_all(&self) -> litharvest_db::Result<u64> {
        if self.fail_count.load(Ordering::SeqCst) {
            return Err(DbError::NotInitialized);
        }
        self.inner.count_all().await
    }

    async fn records_lacking_downstream_sync(&self, limit: usize) -> litharvest_db::Result<Vec<StoredRecord>> {
        self.inner.records_lacking_downstream_sync(limit).await
    }

    async fn mark_synced(&self, ids: &[Uuid]) -> litharvest_db::Result<usize> {
        self.inner.mark_synced(ids).await
    }
}
