//! Bibliographic record shared by the source clients and the store.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Which external API a record was harvested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    PubMed,
    Arxiv,
}

impl RecordSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordSource::PubMed => "pubmed",
            RecordSource::Arxiv  => "arxiv",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pubmed" => Some(RecordSource::PubMed),
            "arxiv"  => Some(RecordSource::Arxiv),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publication date at whatever precision the source provided.
///
/// `Unresolved` keeps the raw text so the record never silently takes on
/// an arbitrary date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "precision", rename_all = "snake_case")]
pub enum PublicationDate {
    Day { date: NaiveDate },
    Month { year: i32, month: u32 },
    Year { year: i32 },
    Unresolved { raw: Option<String> },
}

impl PublicationDate {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, PublicationDate::Unresolved { .. })
    }

    /// First calendar day covered by this date, if resolved.
    pub fn earliest_day(&self) -> Option<NaiveDate> {
        match self {
            PublicationDate::Day { date } => Some(*date),
            PublicationDate::Month { year, month } => NaiveDate::from_ymd_opt(*year, *month, 1),
            PublicationDate::Year { year } => NaiveDate::from_ymd_opt(*year, 1, 1),
            PublicationDate::Unresolved { .. } => None,
        }
    }

    pub fn precision(&self) -> &'static str {
        match self {
            PublicationDate::Day { .. }        => "day",
            PublicationDate::Month { .. }      => "month",
            PublicationDate::Year { .. }       => "year",
            PublicationDate::Unresolved { .. } => "unresolved",
        }
    }

    /// Raw source text, kept only for unresolved dates.
    pub fn raw(&self) -> Option<&str> {
        match self {
            PublicationDate::Unresolved { raw } => raw.as_deref(),
            _ => None,
        }
    }

    /// Rebuild from the `(pub_date, date_precision, date_raw)` storage columns.
    pub fn from_columns(date: Option<NaiveDate>, precision: &str, raw: Option<String>) -> Self {
        match (precision, date) {
            ("day", Some(d))   => PublicationDate::Day { date: d },
            ("month", Some(d)) => PublicationDate::Month { year: d.year(), month: d.month() },
            ("year", Some(d))  => PublicationDate::Year { year: d.year() },
            _ => PublicationDate::Unresolved { raw },
        }
    }
}

impl std::fmt::Display for PublicationDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublicationDate::Day { date } => write!(f, "{}", date.format("%Y-%m-%d")),
            PublicationDate::Month { year, month } => write!(f, "{year:04}-{month:02}"),
            PublicationDate::Year { year } => write!(f, "{year:04}"),
            PublicationDate::Unresolved { raw: Some(raw) } => write!(f, "unresolved ({raw})"),
            PublicationDate::Unresolved { raw: None } => f.write_str("unresolved"),
        }
    }
}

/// Identifiers a record may carry besides its natural key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIds {
    pub pmid: Option<String>,
    pub arxiv_id: Option<String>,
    pub doi: Option<String>,
    pub pmc_id: Option<String>,
}

/// A lookup key for matching an incoming record against stored rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NaturalKey {
    Pmid(String),
    ArxivId(String),
}

impl NaturalKey {
    pub fn column(&self) -> &'static str {
        match self {
            NaturalKey::Pmid(_)    => "pmid",
            NaturalKey::ArxivId(_) => "arxiv_id",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            NaturalKey::Pmid(v) | NaturalKey::ArxivId(v) => v,
        }
    }
}

/// One bibliographic entry as fetched from a metadata source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub source: RecordSource,
    /// The source's stable identifier (PMID or arXiv ID).
    pub natural_key: String,
    pub title: String,
    pub authors: Vec<String>,
    pub abstract_text: String,
    pub published: PublicationDate,
    pub journal: Option<String>,
    pub ids: ExternalIds,
    /// MeSH descriptors or arXiv categories.
    pub subjects: Vec<String>,
    pub publication_types: Vec<String>,
    pub full_text_url: Option<String>,
    pub full_text: Option<String>,
}

impl Record {
    /// Keys to try when matching against storage, in precedence order:
    /// PMID first, then arXiv ID.
    pub fn lookup_keys(&self) -> Vec<NaturalKey> {
        let mut keys = Vec::with_capacity(2);
        if let Some(pmid) = non_empty(&self.ids.pmid) {
            keys.push(NaturalKey::Pmid(pmid.to_string()));
        }
        if let Some(arxiv) = non_empty(&self.ids.arxiv_id) {
            keys.push(NaturalKey::ArxivId(arxiv.to_string()));
        }
        keys
    }

    /// Overwrite this record's mutable fields with the non-empty fields of
    /// `incoming`. The natural key and source are kept. A resolved date is
    /// never replaced by an unresolved one.
    pub fn merge_from(&mut self, incoming: &Record) {
        if !incoming.title.trim().is_empty() {
            self.title = incoming.title.clone();
        }
        if !incoming.authors.is_empty() {
            self.authors = incoming.authors.clone();
        }
        if !incoming.abstract_text.trim().is_empty() {
            self.abstract_text = incoming.abstract_text.clone();
        }
        if incoming.published.is_resolved() || !self.published.is_resolved() {
            self.published = incoming.published.clone();
        }
        merge_opt(&mut self.journal, &incoming.journal);
        merge_opt(&mut self.ids.pmid, &incoming.ids.pmid);
        merge_opt(&mut self.ids.arxiv_id, &incoming.ids.arxiv_id);
        merge_opt(&mut self.ids.doi, &incoming.ids.doi);
        merge_opt(&mut self.ids.pmc_id, &incoming.ids.pmc_id);
        if !incoming.subjects.is_empty() {
            self.subjects = incoming.subjects.clone();
        }
        if !incoming.publication_types.is_empty() {
            self.publication_types = incoming.publication_types.clone();
        }
        merge_opt(&mut self.full_text_url, &incoming.full_text_url);
        merge_opt(&mut self.full_text, &incoming.full_text);
    }
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn merge_opt(target: &mut Option<String>, incoming: &Option<String>) {
    if let Some(v) = non_empty(incoming) {
        *target = Some(v.to_string());
    }
}
