//! PubMed E-utilities client.
//!
//! Endpoints used:
//!   esearch: {base}/esearch.fcgi  (PMIDs for a query and date range)
//!   efetch:  {base}/efetch.fcgi   (PubmedArticle XML, or PMC full text with db=pmc)
//!
//! NCBI allows 3 requests/s without an API key and 10 with one; the default
//! limiter spacing follows that.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use litharvest_common::sandbox::SandboxClient;
use litharvest_common::{ExternalIds, HarvestError, Record, RecordSource, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, info, instrument, warn};

use super::{MetadataSource, Transport};
use crate::dates;
use crate::models::{FetchOutcome, FullTextLookup, MalformedEntry, SearchPage, SearchRequest, SortOrder};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;

pub const DEFAULT_BASE_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
const PMC_ARTICLE_URL: &str = "https://www.ncbi.nlm.nih.gov/pmc/articles";

/// esearch refuses larger pages.
pub const MAX_SEARCH_PAGE: usize = 10_000;
/// Largest id list accepted by one efetch call.
pub const MAX_IDS_PER_FETCH: usize = 200;

/// Connection settings for [`PubMedClient`].
#[derive(Debug, Clone)]
pub struct PubMedSettings {
    pub base_url: String,
    /// Contact address NCBI asks every tool to send.
    pub email: Option<String>,
    pub tool: String,
    pub api_key: Option<String>,
    /// Query used when a search request carries none.
    pub default_term: String,
    pub max_ids_per_fetch: usize,
    /// Overrides the key-dependent default spacing.
    pub request_interval: Option<Duration>,
    pub timeout: Duration,
}

impl Default for PubMedSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            email: None,
            tool: "litharvest".to_string(),
            api_key: None,
            default_term: "all[sb]".to_string(),
            max_ids_per_fetch: MAX_IDS_PER_FETCH,
            request_interval: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl PubMedSettings {
    pub fn request_interval(&self) -> Duration {
        self.request_interval.unwrap_or(match self.api_key {
            Some(_) => Duration::from_millis(100),
            None => Duration::from_millis(340),
        })
    }
}

pub struct PubMedClient {
    transport: Transport,
    settings: PubMedSettings,
}

impl PubMedClient {
    pub fn new(settings: PubMedSettings, retry: RetryPolicy) -> Result<Self> {
        let mut client = SandboxClient::with_timeout(settings.timeout)?;
        client.allow_url_host(&settings.base_url)?;
        let limiter = RateLimiter::new(settings.request_interval());
        Ok(Self { transport: Transport::new(client, limiter, retry), settings })
    }

    pub fn settings(&self) -> &PubMedSettings {
        &self.settings
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{name}", self.settings.base_url.trim_end_matches('/'))
    }

    /// `tool`, `email` and `api_key`, sent on every call.
    fn base_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("tool", self.settings.tool.clone())];
        if let Some(email) = &self.settings.email {
            params.push(("email", email.clone()));
        }
        if let Some(key) = &self.settings.api_key {
            params.push(("api_key", key.clone()));
        }
        params
    }

    /// Fetch one chunk of at most `max_ids_per_fetch` PMIDs.
    #[instrument(skip(self, pmids), fields(count = pmids.len()))]
    async fn efetch_chunk(&self, pmids: &[String]) -> Result<FetchOutcome> {
        let mut params = self.base_params();
        params.push(("db", "pubmed".to_string()));
        params.push(("id", pmids.join(",")));
        params.push(("retmode", "xml".to_string()));

        let xml = self.transport.get_text("pubmed.efetch", &self.endpoint("efetch.fcgi"), &params).await?;
        let mut outcome = parse_efetch_response(&xml)?;

        // Requested ids the provider silently left out.
        let returned: HashSet<&str> = outcome
            .records
            .iter()
            .map(|r| r.natural_key.as_str())
            .chain(outcome.malformed.iter().filter_map(|m| m.key.as_deref()))
            .collect();
        let missing: Vec<MalformedEntry> = pmids
            .iter()
            .filter(|id| !returned.contains(id.as_str()))
            .map(|id| MalformedEntry { key: Some(id.clone()), reason: "not returned by efetch".to_string() })
            .collect();
        outcome.malformed.extend(missing);
        Ok(outcome)
    }
}

#[async_trait]
impl MetadataSource for PubMedClient {
    fn name(&self) -> &'static str {
        "pubmed"
    }

    fn max_page_size(&self) -> usize {
        MAX_SEARCH_PAGE
    }

    #[instrument(skip(self, request), fields(offset = request.start_offset, max = request.max_results))]
    async fn search(&self, request: &SearchRequest) -> Result<SearchPage> {
        let term = if request.query.trim().is_empty() {
            self.settings.default_term.clone()
        } else {
            request.query.clone()
        };

        let mut params = self.base_params();
        params.push(("db", "pubmed".to_string()));
        params.push(("term", term));
        params.push(("retmax", request.max_results.min(MAX_SEARCH_PAGE).to_string()));
        params.push(("retstart", request.start_offset.to_string()));
        params.push(("retmode", "xml".to_string()));
        params.push(("sort", match request.sort {
            SortOrder::Relevance => "relevance",
            SortOrder::Date => "pub_date",
        }.to_string()));
        if let Some(range) = request.date_range {
            params.push(("datetype", "pdat".to_string()));
            params.push(("mindate", range.start.format("%Y/%m/%d").to_string()));
            params.push(("maxdate", range.end.format("%Y/%m/%d").to_string()));
        }

        let xml = self.transport.get_text("pubmed.esearch", &self.endpoint("esearch.fcgi"), &params).await?;
        let ids = parse_esearch_response(&xml)?;
        debug!(count = ids.len(), "PubMed esearch returned PMIDs");
        Ok(SearchPage::from_keys(ids))
    }

    async fn fetch(&self, keys: &[String]) -> Result<FetchOutcome> {
        let mut outcome = FetchOutcome::default();
        for chunk in keys.chunks(self.settings.max_ids_per_fetch.clamp(1, MAX_IDS_PER_FETCH)) {
            outcome.extend(self.efetch_chunk(chunk).await?);
        }
        if !outcome.malformed.is_empty() {
            warn!(malformed = outcome.malformed.len(), "Dropped malformed PubMed entries");
        }
        Ok(outcome)
    }

    /// PMC full-text XML for records that carry a PMC ID.
    #[instrument(skip(self, record), fields(pmid = %record.natural_key))]
    async fn fetch_full_text(&self, record: &Record) -> FullTextLookup {
        let Some(pmc_id) = record.ids.pmc_id.as_deref() else {
            return FullTextLookup::NotAvailable;
        };
        let numeric = pmc_id.trim().trim_start_matches("PMC");

        let mut params = self.base_params();
        params.push(("db", "pmc".to_string()));
        params.push(("id", numeric.to_string()));
        params.push(("retmode", "xml".to_string()));

        match self.transport.get_text("pmc.efetch", &self.endpoint("efetch.fcgi"), &params).await {
            Ok(xml) if xml.trim().is_empty() || xml.contains("<error") => FullTextLookup::NotAvailable,
            Ok(xml) => {
                info!(pmc_id, bytes = xml.len(), "Fetched PMC full text");
                FullTextLookup::Found(xml)
            }
            Err(HarvestError::NotAvailable { .. }) => FullTextLookup::NotAvailable,
            Err(e) => FullTextLookup::Failed(e),
        }
    }
}

// ── XML helpers ──────────────────────────────────────────────────────────────

fn local_name(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn ends_with(path: &[String], tail: &[&str]) -> bool {
    path.len() >= tail.len() && path[path.len() - tail.len()..].iter().zip(tail).all(|(a, b)| a == b)
}

/// Collapse runs of whitespace left by inline markup and line breaks.
fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_error(what: &str, e: impl std::fmt::Display) -> HarvestError {
    HarvestError::Parse(format!("{what}: {e}"))
}

// ── esearch ──────────────────────────────────────────────────────────────────

/// PMIDs from an `<eSearchResult>` document. A missing `<IdList>` is an
/// empty page; an `<ERROR>` with no `<IdList>` is a provider failure.
pub fn parse_esearch_response(xml: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut ids = Vec::new();
    let mut saw_root = false;
    let mut saw_id_list = false;
    let mut provider_error: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name(e.name().as_ref());
                if path.is_empty() {
                    if name != "eSearchResult" {
                        return Err(HarvestError::Parse(format!("unexpected esearch root <{name}>")));
                    }
                    saw_root = true;
                }
                if name == "IdList" {
                    saw_id_list = true;
                }
                path.push(name);
                text.clear();
            }
            Ok(Event::Empty(e)) => {
                let name = local_name(e.name().as_ref());
                if path.is_empty() {
                    return Err(HarvestError::Parse(format!("unexpected esearch root <{name}/>")));
                }
                if name == "IdList" {
                    saw_id_list = true;
                }
            }
            Ok(Event::Text(e)) => {
                text.push_str(&e.unescape().map_err(|e| parse_error("esearch text", e))?);
            }
            Ok(Event::End(_)) => {
                if ends_with(&path, &["IdList", "Id"]) {
                    let id = text.trim();
                    if !id.is_empty() {
                        ids.push(id.to_string());
                    }
                } else if ends_with(&path, &["eSearchResult", "ERROR"]) {
                    provider_error = Some(normalize(&text));
                }
                path.pop();
                text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(parse_error("esearch XML", e)),
            _ => {}
        }
    }

    if !saw_root {
        return Err(HarvestError::Parse("empty esearch response".to_string()));
    }
    if !path.is_empty() {
        return Err(HarvestError::Parse("truncated esearch response".to_string()));
    }
    if let (false, Some(msg)) = (saw_id_list, provider_error) {
        return Err(HarvestError::Parse(format!("esearch error: {msg}")));
    }
    Ok(ids)
}

// ── efetch ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ArticleBuilder {
    pmid: Option<String>,
    title: String,
    abstract_parts: Vec<(Option<String>, String)>,
    authors: Vec<String>,
    journal: Option<String>,
    year: Option<String>,
    month: Option<String>,
    day: Option<String>,
    medline_date: Option<String>,
    doi: Option<String>,
    pmc_id: Option<String>,
    mesh: Vec<String>,
    publication_types: Vec<String>,
}

impl ArticleBuilder {
    fn build(self) -> std::result::Result<Record, MalformedEntry> {
        let Some(pmid) = self.pmid.filter(|p| !p.is_empty()) else {
            return Err(MalformedEntry { key: None, reason: "missing PMID".to_string() });
        };
        if !pmid.chars().all(|c| c.is_ascii_digit()) {
            return Err(MalformedEntry { key: Some(pmid.clone()), reason: format!("non-numeric PMID '{pmid}'") });
        }
        if self.title.is_empty() {
            return Err(MalformedEntry { key: Some(pmid), reason: "missing or empty title".to_string() });
        }

        let structured = self.abstract_parts.len() > 1;
        let abstract_text = self
            .abstract_parts
            .into_iter()
            .filter(|(_, text)| !text.is_empty())
            .map(|(label, text)| match label {
                Some(label) if structured && !label.is_empty() => format!("{label}: {text}"),
                _ => text,
            })
            .collect::<Vec<_>>()
            .join(" ");

        let published = dates::resolve(
            self.year.as_deref(),
            self.month.as_deref(),
            self.day.as_deref(),
            self.medline_date.as_deref(),
        );
        let full_text_url = self.pmc_id.as_ref().map(|id| format!("{PMC_ARTICLE_URL}/{id}/"));

        Ok(Record {
            source: RecordSource::PubMed,
            natural_key: pmid.clone(),
            title: self.title,
            authors: self.authors,
            abstract_text,
            published,
            journal: self.journal,
            ids: ExternalIds { pmid: Some(pmid), arxiv_id: None, doi: self.doi, pmc_id: self.pmc_id },
            subjects: self.mesh,
            publication_types: self.publication_types,
            full_text_url,
            full_text: None,
        })
    }
}

/// Per-element state captured from start tags.
#[derive(Default)]
struct Pending {
    abstract_label: Option<String>,
    article_id_type: Option<String>,
    last_name: Option<String>,
    fore_name: Option<String>,
    collective: Option<String>,
}

/// Parse a `<PubmedArticleSet>` document. Entries that can't become a
/// [`Record`] land in `malformed`; only a broken envelope is an error.
pub fn parse_efetch_response(xml: &str) -> Result<FetchOutcome> {
    let mut reader = Reader::from_str(xml);
    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut outcome = FetchOutcome::default();
    let mut current: Option<ArticleBuilder> = None;
    let mut pending = Pending::default();
    let mut saw_root = false;

    loop {
        let event = reader.read_event().map_err(|e| parse_error("efetch XML", e))?;
        let (start, is_empty) = match &event {
            Event::Start(e) => (Some(e.clone()), false),
            Event::Empty(e) => (Some(e.clone()), true),
            _ => (None, false),
        };

        if let Some(e) = start {
            let name = local_name(e.name().as_ref());
            if path.is_empty() {
                if name != "PubmedArticleSet" {
                    return Err(HarvestError::Parse(format!("unexpected efetch root <{name}>")));
                }
                saw_root = true;
            }
            match name.as_str() {
                "PubmedArticle" => current = Some(ArticleBuilder::default()),
                "AbstractText" => pending.abstract_label = attr(&e, b"Label"),
                "ArticleId" => pending.article_id_type = attr(&e, b"IdType"),
                "Author" => {
                    pending.last_name = None;
                    pending.fore_name = None;
                    pending.collective = None;
                }
                _ => {}
            }
            if !inside_mixed_content(&path) {
                text.clear();
            }
            path.push(name);
            if !is_empty {
                continue;
            }
        }

        match event {
            Event::Text(e) => {
                text.push_str(&e.unescape().map_err(|e| parse_error("efetch text", e))?);
            }
            Event::CData(e) => text.push_str(&String::from_utf8_lossy(&e.into_inner())),
            Event::End(_) | Event::Empty(_) => {
                if let Some(article) = current.as_mut() {
                    on_end(&path, &text, article, &mut pending);
                }
                if path.last().map(String::as_str) == Some("PubmedArticle") {
                    if let Some(article) = current.take() {
                        match article.build() {
                            Ok(record) => outcome.records.push(record),
                            Err(entry) => {
                                warn!(key = ?entry.key, reason = %entry.reason, "Malformed PubMed entry");
                                outcome.malformed.push(entry);
                            }
                        }
                    }
                }
                path.pop();
                // Inline markup inside titles and abstracts keeps accumulating.
                if !inside_mixed_content(&path) {
                    text.clear();
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(HarvestError::Parse("empty efetch response".to_string()));
    }
    if !path.is_empty() {
        return Err(HarvestError::Parse("truncated efetch response".to_string()));
    }
    Ok(outcome)
}

fn inside_mixed_content(path: &[String]) -> bool {
    path.iter().any(|p| p == "ArticleTitle" || p == "AbstractText")
}

fn on_end(path: &[String], text: &str, article: &mut ArticleBuilder, pending: &mut Pending) {
    let value = normalize(text);
    let some_value = || (!value.is_empty()).then(|| value.clone());

    if ends_with(path, &["MedlineCitation", "PMID"]) {
        if article.pmid.is_none() {
            article.pmid = some_value();
        }
    } else if ends_with(path, &["Article", "ArticleTitle"]) {
        article.title = value.clone();
    } else if ends_with(path, &["Abstract", "AbstractText"]) {
        article.abstract_parts.push((pending.abstract_label.take(), value));
    } else if ends_with(path, &["Author", "LastName"]) {
        pending.last_name = some_value();
    } else if ends_with(path, &["Author", "ForeName"]) {
        pending.fore_name = some_value();
    } else if ends_with(path, &["Author", "CollectiveName"]) {
        pending.collective = some_value();
    } else if ends_with(path, &["AuthorList", "Author"]) {
        let name = match (pending.fore_name.take(), pending.last_name.take(), pending.collective.take()) {
            (Some(fore), Some(last), _) => Some(format!("{fore} {last}")),
            (None, Some(last), _) => Some(last),
            (_, None, collective) => collective,
        };
        if let Some(name) = name {
            article.authors.push(name);
        }
    } else if ends_with(path, &["Journal", "Title"]) {
        article.journal = some_value();
    } else if ends_with(path, &["PubDate", "Year"]) {
        article.year = some_value();
    } else if ends_with(path, &["PubDate", "Month"]) {
        article.month = some_value();
    } else if ends_with(path, &["PubDate", "Day"]) {
        article.day = some_value();
    } else if ends_with(path, &["PubDate", "MedlineDate"]) {
        article.medline_date = some_value();
    } else if ends_with(path, &["MeshHeading", "DescriptorName"]) {
        if let Some(v) = some_value() {
            article.mesh.push(v);
        }
    } else if ends_with(path, &["PublicationTypeList", "PublicationType"]) {
        if let Some(v) = some_value() {
            article.publication_types.push(v);
        }
    } else if ends_with(path, &["PubmedData", "ArticleIdList", "ArticleId"]) {
        match pending.article_id_type.take().as_deref() {
            Some("doi") if article.doi.is_none() => article.doi = some_value(),
            Some("pmc") if article.pmc_id.is_none() => article.pmc_id = some_value(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use litharvest_common::PublicationDate;
    use pretty_assertions::assert_eq;

    const ESEARCH: &str = r#"<?xml version="1.0" encoding="UTF-8" ?>
<!DOCTYPE eSearchResult PUBLIC "-//NLM//DTD esearch 20060628//EN" "https://eutils.ncbi.nlm.nih.gov/eutils/dtd/20060628/esearch.dtd">
<eSearchResult><Count>2</Count><RetMax>2</RetMax><RetStart>0</RetStart>
<IdList>
<Id>38012345</Id>
<Id>38012346</Id>
</IdList>
</eSearchResult>"#;

    fn article(pmid: &str, title: &str) -> String {
        format!(
            r#"<PubmedArticle>
  <MedlineCitation Status="MEDLINE" Owner="NLM">
    <PMID Version="1">{pmid}</PMID>
    <Article PubModel="Print">
      <Journal>
        <JournalIssue CitedMedium="Internet">
          <PubDate><Year>2023</Year><Month>Apr</Month><Day>17</Day></PubDate>
        </JournalIssue>
        <Title>Nature</Title>
      </Journal>
      <ArticleTitle>{title}</ArticleTitle>
      <Abstract><AbstractText>Plain abstract.</AbstractText></Abstract>
      <AuthorList>
        <Author><LastName>Smith</LastName><ForeName>John</ForeName></Author>
      </AuthorList>
    </Article>
  </MedlineCitation>
  <PubmedData>
    <ArticleIdList>
      <ArticleId IdType="pubmed">{pmid}</ArticleId>
    </ArticleIdList>
  </PubmedData>
</PubmedArticle>"#
        )
    }

    fn article_set(articles: &[String]) -> String {
        format!("<?xml version=\"1.0\"?>\n<PubmedArticleSet>\n{}\n</PubmedArticleSet>", articles.join("\n"))
    }

    #[test]
    fn test_parse_esearch_ids() {
        assert_eq!(parse_esearch_response(ESEARCH).unwrap(), vec!["38012345", "38012346"]);
    }

    #[test]
    fn test_parse_esearch_empty_page() {
        let xml = "<eSearchResult><Count>0</Count><IdList/></eSearchResult>";
        assert!(parse_esearch_response(xml).unwrap().is_empty());
        let xml = "<eSearchResult><Count>0</Count></eSearchResult>";
        assert!(parse_esearch_response(xml).unwrap().is_empty());
    }

    #[test]
    fn test_parse_esearch_envelope_failures() {
        for xml in [
            "",
            "<html><body>Bad gateway</body></html>",
            "<eSearchResult><IdList><Id>1</Id>",
            "<eSearchResult><ERROR>Search Backend failed</ERROR></eSearchResult>",
        ] {
            let err = parse_esearch_response(xml).unwrap_err();
            assert!(matches!(err, HarvestError::Parse(_)), "{xml}: {err}");
        }
    }

    #[test]
    fn test_parse_minimal_article() {
        let xml = article_set(&[article("12345678", "KRAS G12D in pancreatic cancer")]);
        let outcome = parse_efetch_response(&xml).unwrap();
        assert!(outcome.malformed.is_empty());
        let r = &outcome.records[0];
        assert_eq!(r.natural_key, "12345678");
        assert_eq!(r.ids.pmid.as_deref(), Some("12345678"));
        assert_eq!(r.title, "KRAS G12D in pancreatic cancer");
        assert_eq!(r.authors, vec!["John Smith"]);
        assert_eq!(r.journal.as_deref(), Some("Nature"));
        assert_eq!(r.abstract_text, "Plain abstract.");
        assert_eq!(
            r.published,
            PublicationDate::Day { date: NaiveDate::from_ymd_opt(2023, 4, 17).unwrap() }
        );
    }

    #[test]
    fn test_parse_full_article() {
        let xml = r#"<PubmedArticleSet><PubmedArticle>
  <MedlineCitation>
    <PMID Version="1">31452104</PMID>
    <Article>
      <Journal>
        <JournalIssue><PubDate><MedlineDate>2019 Mar-Apr</MedlineDate></PubDate></JournalIssue>
        <Title>Cancer cell</Title>
      </Journal>
      <ArticleTitle>The <i>KRAS</i> G12C inhibitor &amp; friends.</ArticleTitle>
      <Abstract>
        <AbstractText Label="BACKGROUND">Why it matters.</AbstractText>
        <AbstractText Label="RESULTS">What <b>we</b> found.</AbstractText>
      </Abstract>
      <AuthorList>
        <Author><LastName>Doe</LastName><ForeName>Jane</ForeName></Author>
        <Author><LastName>Roe</LastName></Author>
        <Author><CollectiveName>KRAS Consortium</CollectiveName></Author>
      </AuthorList>
      <PublicationTypeList>
        <PublicationType UI="D016428">Journal Article</PublicationType>
        <PublicationType UI="D016454">Review</PublicationType>
      </PublicationTypeList>
    </Article>
    <MeshHeadingList>
      <MeshHeading><DescriptorName UI="D006801">Humans</DescriptorName></MeshHeading>
      <MeshHeading><DescriptorName UI="D010190">Pancreatic Neoplasms</DescriptorName><QualifierName>genetics</QualifierName></MeshHeading>
    </MeshHeadingList>
    <CommentsCorrectionsList>
      <CommentsCorrections RefType="CommentIn"><PMID Version="1">99999999</PMID></CommentsCorrections>
    </CommentsCorrectionsList>
  </MedlineCitation>
  <PubmedData>
    <ArticleIdList>
      <ArticleId IdType="pubmed">31452104</ArticleId>
      <ArticleId IdType="doi">10.1016/j.ccell.2019.01.001</ArticleId>
      <ArticleId IdType="pmc">PMC6543210</ArticleId>
    </ArticleIdList>
    <ReferenceList>
      <Reference><ArticleIdList><ArticleId IdType="doi">10.9999/other</ArticleId></ArticleIdList></Reference>
    </ReferenceList>
  </PubmedData>
</PubmedArticle></PubmedArticleSet>"#;

        let outcome = parse_efetch_response(xml).unwrap();
        assert_eq!(outcome.records.len(), 1);
        let r = &outcome.records[0];
        assert_eq!(r.natural_key, "31452104");
        assert_eq!(r.title, "The KRAS G12C inhibitor & friends.");
        assert_eq!(r.abstract_text, "BACKGROUND: Why it matters. RESULTS: What we found.");
        assert_eq!(r.authors, vec!["Jane Doe", "Roe", "KRAS Consortium"]);
        assert_eq!(r.published, PublicationDate::Month { year: 2019, month: 3 });
        assert_eq!(r.subjects, vec!["Humans", "Pancreatic Neoplasms"]);
        assert_eq!(r.publication_types, vec!["Journal Article", "Review"]);
        assert_eq!(r.ids.doi.as_deref(), Some("10.1016/j.ccell.2019.01.001"));
        assert_eq!(r.ids.pmc_id.as_deref(), Some("PMC6543210"));
        assert_eq!(
            r.full_text_url.as_deref(),
            Some("https://www.ncbi.nlm.nih.gov/pmc/articles/PMC6543210/")
        );
    }

    #[test]
    fn test_unreadable_date_is_unresolved() {
        let xml = article_set(&[article("1", "T")])
            .replace("<Year>2023</Year><Month>Apr</Month><Day>17</Day>", "<MedlineDate>Winter</MedlineDate>");
        let outcome = parse_efetch_response(&xml).unwrap();
        assert_eq!(
            outcome.records[0].published,
            PublicationDate::Unresolved { raw: Some("Winter".to_string()) }
        );
    }

    #[test]
    fn test_malformed_entries_do_not_fail_the_batch() {
        let mut articles: Vec<String> = (1..=9).map(|i| article(&format!("{i}"), "Fine")).collect();
        articles.push(article("10", ""));
        articles.push(article("not-a-pmid", "Bad key"));
        let outcome = parse_efetch_response(&article_set(&articles)).unwrap();

        assert_eq!(outcome.records.len(), 9);
        assert_eq!(outcome.malformed.len(), 2);
        assert_eq!(outcome.malformed[0].key.as_deref(), Some("10"));
        assert!(outcome.malformed[1].reason.contains("non-numeric"));
    }

    #[test]
    fn test_efetch_envelope_failures() {
        let truncated = article_set(&[article("1", "T")]).replace("</PubmedArticleSet>", "");
        for xml in ["", "<error>Service unavailable</error>", truncated.as_str()] {
            let err = parse_efetch_response(xml).unwrap_err();
            assert!(matches!(err, HarvestError::Parse(_)), "{err}");
        }
    }

    #[test]
    fn test_request_interval_depends_on_api_key() {
        let mut s = PubMedSettings::default();
        assert_eq!(s.request_interval(), Duration::from_millis(340));
        s.api_key = Some("k".to_string());
        assert_eq!(s.request_interval(), Duration::from_millis(100));
        s.request_interval = Some(Duration::from_secs(1));
        assert_eq!(s.request_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_client_rejects_invalid_base_url() {
        let settings = PubMedSettings { base_url: "not a url".to_string(), ..Default::default() };
        assert!(matches!(
            PubMedClient::new(settings, RetryPolicy::default()),
            Err(HarvestError::Config(_))
        ));
    }
}
