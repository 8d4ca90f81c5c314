//! arXiv Atom API client.
//!
//! `search` pages through `api/query` with a `submittedDate` range. The
//! feed already carries full entries, so the latest page is kept until the
//! following `fetch` asks for it; only keys not on that page are
//! re-requested through `id_list`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use litharvest_common::sandbox::SandboxClient;
use litharvest_common::{ExternalIds, HarvestError, PublicationDate, Record, RecordSource, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, instrument, warn};

use super::{MetadataSource, Transport};
use crate::dates;
use crate::models::{FetchOutcome, MalformedEntry, SearchPage, SearchRequest, SortOrder};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;

pub const DEFAULT_BASE_URL: &str = "https://export.arxiv.org/api/query";

/// Largest page the API serves reliably.
pub const MAX_SEARCH_PAGE: usize = 2_000;

#[derive(Debug, Clone)]
pub struct ArxivSettings {
    pub base_url: String,
    /// Query used when a search request carries none, e.g. `cat:cs.LG`.
    pub default_query: String,
    /// arXiv asks for one request every three seconds.
    pub request_interval: Duration,
    pub max_ids_per_fetch: usize,
    pub timeout: Duration,
}

impl Default for ArxivSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            default_query: String::new(),
            request_interval: Duration::from_secs(3),
            max_ids_per_fetch: 200,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct EntryCache {
    records: HashMap<String, Record>,
    malformed: HashMap<String, String>,
}

pub struct ArxivClient {
    transport: Transport,
    settings: ArxivSettings,
    cache: Mutex<EntryCache>,
}

impl ArxivClient {
    pub fn new(settings: ArxivSettings, retry: RetryPolicy) -> Result<Self> {
        let mut client = SandboxClient::with_timeout(settings.timeout)?;
        client.allow_url_host(&settings.base_url)?;
        let limiter = RateLimiter::new(settings.request_interval);
        Ok(Self {
            transport: Transport::new(client, limiter, retry),
            settings,
            cache: Mutex::new(EntryCache::default()),
        })
    }

    pub fn settings(&self) -> &ArxivSettings {
        &self.settings
    }

    /// Replace the cache with the entries of the latest search page.
    fn remember(&self, outcome: &FetchOutcome) {
        let Ok(mut cache) = self.cache.lock() else { return };
        cache.records.clear();
        cache.malformed.clear();
        for record in &outcome.records {
            cache.records.insert(record.natural_key.clone(), record.clone());
        }
        for entry in &outcome.malformed {
            if let Some(key) = &entry.key {
                cache.malformed.insert(key.clone(), entry.reason.clone());
            }
        }
    }

    /// Split `keys` into cached results and keys that still need a request.
    fn take_cached(&self, keys: &[String]) -> (FetchOutcome, Vec<String>) {
        let mut outcome = FetchOutcome::default();
        let mut remaining = Vec::new();
        let Ok(mut cache) = self.cache.lock() else {
            return (outcome, keys.to_vec());
        };
        for key in keys {
            if let Some(record) = cache.records.remove(key) {
                outcome.records.push(record);
            } else if let Some(reason) = cache.malformed.remove(key) {
                outcome.malformed.push(MalformedEntry { key: Some(key.clone()), reason });
            } else {
                remaining.push(key.clone());
            }
        }
        (outcome, remaining)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn fetch_by_id_list(&self, ids: &[String]) -> Result<FetchOutcome> {
        let params = vec![
            ("id_list", ids.join(",")),
            ("start", "0".to_string()),
            ("max_results", ids.len().to_string()),
        ];
        let xml = self.transport.get_text("arxiv.id_list", &self.settings.base_url, &params).await?;
        let mut outcome = parse_feed(&xml)?;

        let returned: HashSet<&str> = outcome.records.iter().map(|r| r.natural_key.as_str()).collect();
        let missing: Vec<MalformedEntry> = ids
            .iter()
            .filter(|id| !returned.contains(id.as_str()))
            .filter(|id| !outcome.malformed.iter().any(|m| m.key.as_deref() == Some(id.as_str())))
            .map(|id| MalformedEntry { key: Some(id.clone()), reason: "not returned by id_list".to_string() })
            .collect();
        outcome.malformed.extend(missing);
        Ok(outcome)
    }
}

/// `search_query` for a request: the free-text part ANDed with the
/// submission-date window.
pub fn build_search_query(query: &str, request: &SearchRequest) -> Option<String> {
    let mut parts = Vec::new();
    let q = query.trim();
    if !q.is_empty() {
        parts.push(format!("({q})"));
    }
    if let Some(range) = request.date_range {
        parts.push(format!(
            "submittedDate:[{}0000 TO {}2359]",
            range.start.format("%Y%m%d"),
            range.end.format("%Y%m%d")
        ));
    }
    (!parts.is_empty()).then(|| parts.join(" AND "))
}

/// Search page for a parsed query feed. Entries without a usable id still
/// count toward `returned`.
pub fn page_from_feed(outcome: &FetchOutcome) -> SearchPage {
    let mut page = SearchPage {
        returned: outcome.records.len() + outcome.malformed.len(),
        ..SearchPage::default()
    };
    page.keys.extend(outcome.records.iter().map(|r| r.natural_key.clone()));
    for m in &outcome.malformed {
        match &m.key {
            Some(key) => page.keys.push(key.clone()),
            None => page.malformed.push(m.clone()),
        }
    }
    page
}

#[async_trait]
impl MetadataSource for ArxivClient {
    fn name(&self) -> &'static str {
        "arxiv"
    }

    fn max_page_size(&self) -> usize {
        MAX_SEARCH_PAGE
    }

    #[instrument(skip(self, request), fields(offset = request.start_offset, max = request.max_results))]
    async fn search(&self, request: &SearchRequest) -> Result<SearchPage> {
        let query = if request.query.trim().is_empty() {
            self.settings.default_query.as_str()
        } else {
            request.query.as_str()
        };
        let search_query = build_search_query(query, request).ok_or_else(|| {
            HarvestError::Config("arXiv search needs a query or a date range".to_string())
        })?;

        let params = vec![
            ("search_query", search_query),
            ("start", request.start_offset.to_string()),
            ("max_results", request.max_results.min(MAX_SEARCH_PAGE).to_string()),
            ("sortBy", match request.sort {
                SortOrder::Relevance => "relevance",
                SortOrder::Date => "submittedDate",
            }.to_string()),
            ("sortOrder", "descending".to_string()),
        ];

        let xml = self.transport.get_text("arxiv.query", &self.settings.base_url, &params).await?;
        let outcome = parse_feed(&xml)?;
        let page = page_from_feed(&outcome);
        self.remember(&outcome);
        debug!(returned = page.returned, keys = page.keys.len(), "arXiv query returned entries");
        Ok(page)
    }

    async fn fetch(&self, keys: &[String]) -> Result<FetchOutcome> {
        let (mut outcome, remaining) = self.take_cached(keys);
        for chunk in remaining.chunks(self.settings.max_ids_per_fetch.max(1)) {
            outcome.extend(self.fetch_by_id_list(chunk).await?);
        }
        if !outcome.malformed.is_empty() {
            warn!(malformed = outcome.malformed.len(), "Dropped malformed arXiv entries");
        }
        Ok(outcome)
    }
}

// ── Atom parsing ─────────────────────────────────────────────────────────────

/// Tag name without its namespace prefix (`arxiv:doi` → `doi`).
fn local_name(raw: &[u8]) -> String {
    let name = match raw.iter().position(|b| *b == b':') {
        Some(ix) => &raw[ix + 1..],
        None => raw,
    };
    String::from_utf8_lossy(name).into_owned()
}

fn attr(e: &BytesStart<'_>, key: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| local_name(a.key.as_ref()) == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// `http://arxiv.org/abs/2301.00001v2` → `2301.00001`,
/// `http://arxiv.org/abs/hep-th/9901001v1` → `hep-th/9901001`.
pub fn normalize_id(raw: &str) -> Option<String> {
    let s = raw.trim();
    let s = s.rsplit_once("/abs/").map_or(s, |(_, id)| id);
    let s = s.strip_prefix("arXiv:").unwrap_or(s);
    let core = match s.rfind('v') {
        Some(ix) if ix + 1 < s.len() && s[ix + 1..].chars().all(|c| c.is_ascii_digit()) => &s[..ix],
        _ => s,
    };
    let valid = !core.is_empty()
        && core.chars().any(|c| c.is_ascii_digit())
        && core.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '/' | '-'));
    valid.then(|| core.to_string())
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Default)]
struct EntryBuilder {
    id: Option<String>,
    title: String,
    summary: String,
    authors: Vec<String>,
    published: Option<String>,
    doi: Option<String>,
    journal_ref: Option<String>,
    pdf_url: Option<String>,
    primary_category: Option<String>,
    categories: Vec<String>,
}

enum Entry {
    Record(Record),
    Malformed(MalformedEntry),
    /// The API reports request errors as a feed with a single error entry.
    ProviderError(String),
}

impl EntryBuilder {
    fn build(self) -> Entry {
        let Some(raw_id) = self.id else {
            return Entry::Malformed(MalformedEntry { key: None, reason: "missing id".to_string() });
        };
        if raw_id.contains("/api/errors") {
            let msg = if self.summary.is_empty() { raw_id } else { self.summary };
            return Entry::ProviderError(msg);
        }
        let Some(id) = normalize_id(&raw_id) else {
            return Entry::Malformed(MalformedEntry { key: None, reason: format!("unreadable id '{raw_id}'") });
        };
        if self.title.is_empty() {
            return Entry::Malformed(MalformedEntry { key: Some(id), reason: "missing or empty title".to_string() });
        }

        let mut subjects = Vec::new();
        for cat in self.primary_category.into_iter().chain(self.categories) {
            if !subjects.contains(&cat) {
                subjects.push(cat);
            }
        }
        let published = match self.published.as_deref() {
            Some(raw) => dates::parse_timestamp(raw),
            None => PublicationDate::Unresolved { raw: None },
        };

        Entry::Record(Record {
            source: RecordSource::Arxiv,
            natural_key: id.clone(),
            title: self.title,
            authors: self.authors,
            abstract_text: self.summary,
            published,
            journal: self.journal_ref,
            ids: ExternalIds { pmid: None, arxiv_id: Some(id), doi: self.doi, pmc_id: None },
            subjects,
            publication_types: Vec::new(),
            full_text_url: self.pdf_url,
            full_text: None,
        })
    }
}

/// Parse an Atom `<feed>`. Per-entry problems go to `malformed`; a broken
/// envelope or an API error entry is a [`HarvestError::Parse`].
pub fn parse_feed(xml: &str) -> Result<FetchOutcome> {
    let mut reader = Reader::from_str(xml);
    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut outcome = FetchOutcome::default();
    let mut current: Option<EntryBuilder> = None;
    let mut saw_root = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| HarvestError::Parse(format!("arXiv feed XML: {e}")))?;
        match event {
            Event::Start(e) => {
                let name = local_name(e.name().as_ref());
                if path.is_empty() {
                    if name != "feed" {
                        return Err(HarvestError::Parse(format!("unexpected arXiv root <{name}>")));
                    }
                    saw_root = true;
                }
                if name == "entry" && path.len() == 1 {
                    current = Some(EntryBuilder::default());
                }
                path.push(name);
                text.clear();
            }
            Event::Empty(e) => {
                let name = local_name(e.name().as_ref());
                if path.is_empty() {
                    return Err(HarvestError::Parse(format!("unexpected arXiv root <{name}/>")));
                }
                if let (Some(entry), true) = (current.as_mut(), path.len() == 2) {
                    on_empty(&name, &e, entry);
                }
            }
            Event::Text(e) => {
                let t = e
                    .unescape()
                    .map_err(|e| HarvestError::Parse(format!("arXiv feed text: {e}")))?;
                text.push_str(&t);
            }
            Event::CData(e) => text.push_str(&String::from_utf8_lossy(&e.into_inner())),
            Event::End(_) => {
                if let Some(entry) = current.as_mut() {
                    on_end(&path, &text, entry);
                }
                if path.len() == 2 && path[1] == "entry" {
                    if let Some(entry) = current.take() {
                        match entry.build() {
                            Entry::Record(record) => outcome.records.push(record),
                            Entry::Malformed(m) => {
                                warn!(key = ?m.key, reason = %m.reason, "Malformed arXiv entry");
                                outcome.malformed.push(m);
                            }
                            Entry::ProviderError(msg) => {
                                return Err(HarvestError::Parse(format!("arXiv API error: {msg}")));
                            }
                        }
                    }
                }
                path.pop();
                text.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(HarvestError::Parse("empty arXiv response".to_string()));
    }
    if !path.is_empty() {
        return Err(HarvestError::Parse("truncated arXiv response".to_string()));
    }
    Ok(outcome)
}

fn on_empty(name: &str, e: &BytesStart<'_>, entry: &mut EntryBuilder) {
    match name {
        "link" if attr(e, "title").as_deref() == Some("pdf") => entry.pdf_url = attr(e, "href"),
        "category" => {
            if let Some(term) = attr(e, "term") {
                entry.categories.push(term);
            }
        }
        "primary_category" => entry.primary_category = attr(e, "term"),
        _ => {}
    }
}

fn on_end(path: &[String], text: &str, entry: &mut EntryBuilder) {
    let value = normalize(text);
    let tail: Vec<&str> = path.iter().skip(2).map(String::as_str).collect();
    match tail.as_slice() {
        ["id"] => entry.id = Some(value),
        ["title"] => entry.title = value,
        ["summary"] => entry.summary = value,
        ["published"] => entry.published = Some(value),
        ["doi"] if !value.is_empty() => entry.doi = Some(value),
        ["journal_ref"] if !value.is_empty() => entry.journal_ref = Some(value),
        ["author", "name"] if !value.is_empty() => entry.authors.push(value),
        _ => {}
    }
}
