//! Configuration loading for litharvest.
//! Reads litharvest.toml from the current directory or the path in the
//! LITHARVEST_CONFIG env var. Every field has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{Days, NaiveDate};
use litharvest_common::HarvestError;
use litharvest_ingestion::{
    ArxivSettings, PubMedSettings, RateLimiter, RetryPolicy, SortOrder, WindowOrder, WindowSpan,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pubmed: PubMedConfig,
    #[serde(default)]
    pub arxiv: ArxivConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub harvest: HarvestConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url()    -> String { "postgres://localhost/litharvest".to_string() }
fn default_max_connections() -> u32    { 5 }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: default_database_url(), max_connections: default_max_connections() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubMedConfig {
    #[serde(default = "default_pubmed_url")]
    pub base_url: String,
    pub email: Option<String>,
    #[serde(default = "default_tool")]
    pub tool: String,
    pub api_key: Option<String>,
    #[serde(default = "default_pubmed_term")]
    pub default_term: String,
    #[serde(default = "default_ids_per_fetch")]
    pub max_ids_per_fetch: usize,
    /// Unset: 3/s without an API key, 10/s with one.
    pub requests_per_second: Option<f64>,
}

fn default_pubmed_url()    -> String { litharvest_ingestion::sources::pubmed::DEFAULT_BASE_URL.to_string() }
fn default_tool()          -> String { "litharvest".to_string() }
fn default_pubmed_term()   -> String { "all[sb]".to_string() }
fn default_ids_per_fetch() -> usize  { 200 }

impl Default for PubMedConfig {
    fn default() -> Self {
        Self {
            base_url: default_pubmed_url(),
            email: None,
            tool: default_tool(),
            api_key: None,
            default_term: default_pubmed_term(),
            max_ids_per_fetch: default_ids_per_fetch(),
            requests_per_second: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArxivConfig {
    #[serde(default = "default_arxiv_url")]
    pub base_url: String,
    #[serde(default)]
    pub default_query: String,
    #[serde(default = "default_arxiv_interval")]
    pub request_interval_secs: f64,
    #[serde(default = "default_ids_per_fetch")]
    pub max_ids_per_fetch: usize,
}

fn default_arxiv_url()      -> String { litharvest_ingestion::sources::arxiv::DEFAULT_BASE_URL.to_string() }
fn default_arxiv_interval() -> f64    { 3.0 }

impl Default for ArxivConfig {
    fn default() -> Self {
        Self {
            base_url: default_arxiv_url(),
            default_query: String::new(),
            request_interval_secs: default_arxiv_interval(),
            max_ids_per_fetch: default_ids_per_fetch(),
        }
    }
}

/// A named preset plus optional per-field overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_preset")]
    pub preset: String,
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub jitter: Option<bool>,
}

fn default_retry_preset() -> String { "standard".to_string() }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            preset: default_retry_preset(),
            max_attempts: None,
            initial_delay_ms: None,
            max_delay_ms: None,
            backoff_multiplier: None,
            jitter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    #[serde(default = "default_target")]
    pub target: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Used when no start date is given: harvest this many days back from the end date.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u64,
    /// Run in order until the target is met; empty uses the source's default query.
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default)]
    pub span: WindowSpan,
    #[serde(default)]
    pub order: WindowOrder,
    #[serde(default)]
    pub sort: SortOrder,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_pacing_ms")]
    pub pacing_delay_ms: u64,
    #[serde(default)]
    pub enrich_full_text: bool,
}

fn default_target()        -> u64   { 1_000 }
fn default_batch_size()    -> usize { 100 }
fn default_lookback_days() -> u64   { 365 }
fn default_max_failures()  -> u32   { 5 }
fn default_pacing_ms()     -> u64   { 2_000 }

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            batch_size: default_batch_size(),
            lookback_days: default_lookback_days(),
            queries: Vec::new(),
            span: WindowSpan::default(),
            order: WindowOrder::default(),
            sort: SortOrder::default(),
            max_consecutive_failures: default_max_failures(),
            pacing_delay_ms: default_pacing_ms(),
            enrich_full_text: false,
        }
    }
}

impl HarvestConfig {
    /// Start date `lookback_days` before `end`.
    pub fn start_date(&self, end: NaiveDate) -> Result<NaiveDate, HarvestError> {
        end.checked_sub_days(Days::new(self.lookback_days)).ok_or_else(|| {
            HarvestError::Config(format!("lookback_days = {} reaches past the earliest date", self.lookback_days))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 { 30 }

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { timeout_secs: default_timeout_secs() }
    }
}


impl Config {
    /// Load configuration from `explicit`, else LITHARVEST_CONFIG, else
    /// ./litharvest.toml. A missing file yields the defaults.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let path = explicit.map(Path::to_path_buf).unwrap_or_else(|| {
            PathBuf::from(std::env::var("LITHARVEST_CONFIG").unwrap_or_else(|_| "litharvest.toml".to_string()))
        });

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Self::from_toml(&content).with_context(|| format!("Invalid config file {}", path.display()))?
        } else {
            tracing::warn!("Config file not found: {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// DATABASE_URL and NCBI_API_KEY take precedence over the file.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            self.database.url = url;
        }
        if let Some(key) = lookup("NCBI_API_KEY").filter(|v| !v.trim().is_empty()) {
            self.pubmed.api_key = Some(key);
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.network.timeout_secs.max(1))
    }

    pub fn pubmed_settings(&self) -> Result<PubMedSettings, HarvestError> {
        let p = &self.pubmed;
        // 0 keeps the key-dependent default spacing.
        let request_interval = p
            .requests_per_second
            .filter(|rps| *rps != 0.0)
            .map(|rps| RateLimiter::per_second(rps).map(|l| l.min_interval()))
            .transpose()?;
        Ok(PubMedSettings {
            base_url: p.base_url.clone(),
            email: p.email.clone(),
            tool: p.tool.clone(),
            api_key: p.api_key.clone(),
            default_term: p.default_term.clone(),
            max_ids_per_fetch: p.max_ids_per_fetch,
            request_interval,
            timeout: self.timeout(),
        })
    }

    pub fn arxiv_settings(&self) -> Result<ArxivSettings, HarvestError> {
        let a = &self.arxiv;
        Ok(ArxivSettings {
            base_url: a.base_url.clone(),
            default_query: a.default_query.clone(),
            request_interval: RateLimiter::from_secs(a.request_interval_secs)?.min_interval(),
            max_ids_per_fetch: a.max_ids_per_fetch,
            timeout: self.timeout(),
        })
    }

    pub fn retry_policy(&self) -> anyhow::Result<RetryPolicy> {
        let r = &self.retry;
        let mut policy = RetryPolicy::preset(&r.preset)
            .ok_or_else(|| anyhow::anyhow!("Unknown retry preset '{}' (expected default, standard or slow)", r.preset))?;
        if let Some(n) = r.max_attempts {
            policy.max_attempts = n;
        }
        if let Some(ms) = r.initial_delay_ms {
            policy.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = r.max_delay_ms {
            policy.max_delay = Duration::from_millis(ms);
        }
        if let Some(m) = r.backoff_multiplier {
            policy.backoff_multiplier = m;
        }
        if let Some(j) = r.jitter {
            policy.jitter = j;
        }
        Ok(policy)
    }
}
