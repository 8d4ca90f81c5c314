use reqwest::{Client, ClientBuilder};
use std::collections::HashSet;
use std::time::Duration;
use url::Url;
use crate::error::HarvestError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_USER_AGENT: &str = concat!("litharvest/", env!("CARGO_PKG_VERSION"));

/// An HTTP client that only allows requests to approved metadata providers.
#[derive(Debug, Clone)]
pub struct SandboxClient {
    client: Client,
    allowlist: HashSet<String>,
}

impl SandboxClient {
    /// Creates a client with the default provider allowlist and a 30s timeout.
    pub fn new() -> Result<Self, HarvestError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, HarvestError> {
        let domains = [
            "eutils.ncbi.nlm.nih.gov", // PubMed E-utilities
            "www.ncbi.nlm.nih.gov",    // PMC landing pages
            "export.arxiv.org",        // arXiv API
            "arxiv.org",               // arXiv abstracts / PDFs
            "localhost",
            "127.0.0.1",
        ];
        let allowlist = domains.iter().map(|d| d.to_string()).collect();

        let client = ClientBuilder::new()
            .timeout(timeout)
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .map_err(|e| HarvestError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { client, allowlist })
    }

    /// Appends an exact hostname to the allowlist.
    pub fn allow_domain(&mut self, domain: &str) {
        self.allowlist.insert(domain.to_string());
    }

    /// Allows the host of `base_url`, used when a provider base URL is overridden.
    pub fn allow_url_host(&mut self, base_url: &str) -> Result<(), HarvestError> {
        let parsed = Url::parse(base_url)
            .map_err(|e| HarvestError::Config(format!("Invalid base URL {base_url}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| HarvestError::Config(format!("Base URL has no host: {base_url}")))?;
        self.allow_domain(host);
        Ok(())
    }

    /// Validates if a URL is permitted under the current sandbox policy.
    pub fn is_allowed(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else { return false };
        let Some(host) = parsed.host_str() else { return false };
        // Exact match or a subdomain of an allowed domain
        self.allowlist
            .iter()
            .any(|allowed| host == allowed || host.ends_with(&format!(".{allowed}")))
    }

    /// Exposes the inner `reqwest::Client` builder for GET requests.
    pub fn get(&self, url: &str) -> Result<reqwest::RequestBuilder, HarvestError> {
        if !self.is_allowed(url) {
            return Err(HarvestError::Security(format!(
                "Network capabilities capped: domain not in allowlist for URL {url}"
            )));
        }
        Ok(self.client.get(url))
    }
}
