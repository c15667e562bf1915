use thiserror::Error;

pub type Result<T, E = ScrapeError> = std::result::Result<T, E>;

const RATE_LIMIT_KEYWORDS: [&str; 3] = ["rate limit", "429", "too many requests"];

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("page load did not complete within {timeout_ms}ms")]
    NavigationTimeout { timeout_ms: u64 },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("property index {index} is out of range ({len} urls known)")]
    InvalidIndex { index: usize, len: usize },

    #[error("no property urls were collected from the listing pages")]
    NoUrlsCollected,

    #[error("no data to export")]
    NoData,

    #[error("failed to persist job state to {path}: {reason}")]
    PersistenceFailure { path: String, reason: String },

    #[error("webdriver: {0}")]
    WebDriver(String),

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    RATE_LIMIT_KEYWORDS
        .iter()
        .any(|keyword| lower.contains(keyword))
}

impl ScrapeError {
    pub fn is_rate_limited(&self) -> bool {
        match self {
            ScrapeError::RateLimited(_) => true,
            ScrapeError::InvalidIndex { .. }
            | ScrapeError::NoUrlsCollected
            | ScrapeError::NoData
            | ScrapeError::PersistenceFailure { .. }
            | ScrapeError::InvalidRequest(_) => false,
            other => is_rate_limit_message(&other.to_string()),
        }
    }

    pub fn classify(self) -> Self {
        match self {
            ScrapeError::RateLimited(_) => self,
            other if other.is_rate_limited() => ScrapeError::RateLimited(other.to_string()),
            other => other,
        }
    }

    pub fn is_systemic(&self) -> bool {
        matches!(self, ScrapeError::NoUrlsCollected)
    }
}
