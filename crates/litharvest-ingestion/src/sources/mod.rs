//! Metadata source clients.

pub mod arxiv;
pub mod pubmed;

use async_trait::async_trait;
use litharvest_common::sandbox::SandboxClient;
use litharvest_common::{HarvestError, Record, Result};
use tracing::debug;

use crate::models::{FetchOutcome, FullTextLookup, SearchPage, SearchRequest};
use crate::rate_limit::RateLimiter;
use crate::retry::{with_retry, RetryPolicy};

/// Common interface for paginated bibliographic metadata APIs.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Short provider name used in logs (`pubmed`, `arxiv`).
    fn name(&self) -> &'static str;

    /// Largest page `search` will return; larger requests are cut down.
    fn max_page_size(&self) -> usize {
        usize::MAX
    }

    /// One page of natural keys, in provider order.
    async fn search(&self, request: &SearchRequest) -> Result<SearchPage>;

    /// Full records for `keys`. Entries that fail to parse are reported in
    /// [`FetchOutcome::malformed`] instead of failing the call.
    async fn fetch(&self, keys: &[String]) -> Result<FetchOutcome>;

    /// Best-effort full-text enrichment.
    async fn fetch_full_text(&self, _record: &Record) -> FullTextLookup {
        FullTextLookup::NotAvailable
    }
}

/// Sandboxed HTTP with per-provider spacing and retry.
///
/// Every attempt, including retries, waits on the limiter and holds its
/// permit until the body has been read.
pub struct Transport {
    client: SandboxClient,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl Transport {
    pub fn new(client: SandboxClient, limiter: RateLimiter, retry: RetryPolicy) -> Self {
        Self { client, limiter, retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// GET `url` with `params`, retrying per the policy.
    pub async fn get_text(&self, op: &str, url: &str, params: &[(&str, String)]) -> Result<String> {
        self.get_text_with(&self.retry, op, url, params).await
    }

    /// GET with an explicit policy, e.g. to disable retries for lookups.
    pub async fn get_text_with(
        &self,
        policy: &RetryPolicy,
        op: &str,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<String> {
        with_retry(policy, op, move || async move {
            let _permit = self.limiter.acquire().await;
            let response = self.client.get(url)?.query(params).send().await?;
            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(HarvestError::from_status(status.as_u16(), &body));
            }
            debug!(op, bytes = body.len(), "Response received");
            Ok(body)
        })
        .await
    }
}
