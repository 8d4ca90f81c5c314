use thiserror::Error;

/// Error taxonomy for the ingestion pipeline.
///
/// Variants are grouped by how the pipeline recovers from them:
/// retryable network conditions, per-window skip-and-advance conditions,
/// and fatal conditions that stop the run.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Transient network error: {0}")]
    Transient(String),

    #[error("Rate limited by provider (HTTP 429): {0}")]
    RateLimited(String),

    #[error("Provider overloaded (HTTP {status}): {message}")]
    ServerOverload { status: u16, message: String },

    /// 404 / 403. Callers doing best-effort lookups treat this as "no content".
    #[error("Resource not available (HTTP {status}): {message}")]
    NotAvailable { status: u16, message: String },

    #[error("Provider rejected request (HTTP {status}): {message}")]
    ClientStatus { status: u16, message: String },

    /// Envelope-level parse failure of a search or fetch response.
    #[error("Response parse error: {0}")]
    Parse(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Security error: {0}")]
    Security(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, HarvestError>;

impl HarvestError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = preview(body);
        match status {
            429 => HarvestError::RateLimited(message),
            403 | 404 => HarvestError::NotAvailable { status, message },
            s if s >= 500 => HarvestError::ServerOverload { status, message },
            _ => HarvestError::ClientStatus { status, message },
        }
    }

    /// Whether a retry may succeed where this attempt failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HarvestError::Transient(_)
                | HarvestError::RateLimited(_)
                | HarvestError::ServerOverload { .. }
                | HarvestError::Parse(_)
        )
    }

    /// Whether the error must stop the whole run rather than the current window.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HarvestError::Config(_) | HarvestError::Security(_) | HarvestError::Other(_)
        )
    }
}

impl From<reqwest::Error> for HarvestError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return HarvestError::from_status(status.as_u16(), &err.to_string());
        }
        if err.is_builder() {
            return HarvestError::Config(format!("Invalid HTTP request: {err}"));
        }
        if err.is_decode() {
            return HarvestError::Parse(err.to_string());
        }
        // timeouts, connection resets, truncated bodies
        HarvestError::Transient(err.to_string())
    }
}

/// Truncate a response body for inclusion in an error message.
fn preview(body: &str) -> String {
    const MAX: usize = 200;
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
