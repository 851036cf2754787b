use std::time::Duration;
use thiserror::Error;

pub mod classifier;
pub mod config;
pub mod extractor;
pub mod fetch;
pub mod llm;
pub mod orchestrator;
pub mod pdf;
pub mod prompt;
pub mod scraper;
pub mod store;
pub mod types;
pub mod validator;

// Re-export commonly used types
pub use config::RescrapeConfig;
pub use orchestrator::{BatchOrchestrator, BatchReport};
pub use store::{MemoryRowStore, RowStore, RunLock};
pub use types::{Extraction, Row, Status, UrlType};

/// Errors raised while fetching a URL.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The request did not complete within the per-request timeout.
    #[error("request timed out")]
    Timeout,
    /// The server answered with a non-success status, or the transport failed before any status.
    #[error("HTTP error{}: {message}", .status.map(|s| format!(" {s}")).unwrap_or_default())]
    Http { status: Option<u16>, message: String },
    /// The URL or its payload is of a kind this tool does not extract.
    #[error("unsupported content type: {0}")]
    UnsupportedType(String),
    /// Too many redirects were followed.
    #[error("redirect loop")]
    RedirectLoop,
    /// The body is larger than the configured ceiling; `pdf` tells whether it looked like a PDF.
    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize, pdf: bool },
}

impl FetchError {
    /// Whether a single retry after a short backoff is worth attempting.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout => true,
            FetchError::Http { status: None, .. } => true,
            FetchError::Http { status: Some(s), .. } => *s >= 500 || *s == 429,
            FetchError::UnsupportedType(_) | FetchError::RedirectLoop | FetchError::BodyTooLarge { .. } => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if e.is_redirect() {
            FetchError::RedirectLoop
        } else {
            FetchError::Http {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            }
        }
    }
}

/// Errors raised by the summarization call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SummarizationError {
    #[error("summarization quota exceeded")]
    QuotaExceeded,
    #[error("summarization timed out")]
    Timeout,
    #[error("invalid summarization response: {0}")]
    InvalidResponse(String),
}

/// What kind of row-store operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    ReadAll,
    Append,
    Update,
    Delete,
}

impl std::fmt::Display for StoreOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StoreOp::ReadAll => "read_all",
            StoreOp::Append => "append",
            StoreOp::Update => "update",
            StoreOp::Delete => "delete",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// The transport failed.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The index does not address an existing row.
    #[error("index out of range (sheet has {len} rows)")]
    IndexOutOfRange { len: usize },
    /// Main already holds a row with this FinalURL.
    #[error("duplicate URL {0}")]
    DuplicateUrl(String),
}

/// A failed row-store operation, with enough detail for manual reconciliation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{op} on sheet '{sheet}'{} failed: {kind}", .index.map(|i| format!(" at row {i}")).unwrap_or_default())]
pub struct StoreError {
    pub sheet: String,
    pub index: Option<usize>,
    pub op: StoreOp,
    pub kind: StoreErrorKind,
}

/// The `RescrapeError` enum represents the failures that abort a batch run.
#[derive(Error, Debug)]
pub enum RescrapeError {
    /// Represents an error that occurs while building the HTTP client.
    #[error("HTTP client setup failed: {0}")]
    ClientError(#[from] reqwest::Error),
    /// Represents a failed row-store operation.
    #[error("Row store failure: {0}")]
    StoreError(#[from] StoreError),
    /// Represents an invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ::config::ConfigError),
    /// Represents an invalid pattern in the marker configuration.
    #[error("Invalid marker pattern: {0}")]
    PatternError(#[from] regex::Error),
    /// Represents an error reading or writing the local workbook file.
    #[error("Workbook I/O failed: {0}")]
    IoError(#[from] std::io::Error),
    /// Represents a malformed workbook file.
    #[error("Workbook format error: {0}")]
    FormatError(#[from] serde_json::Error),
}

/// A type alias for `Result` with the `RescrapeError` error type.
pub type Result<T> = std::result::Result<T, RescrapeError>;

// Constants

/// The default timeout duration for HTTP requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// The default number of Error rows taken per batch.
pub const DEFAULT_MAX_ROWS_PER_BATCH: usize = 15;
/// The default wall-clock budget of a batch.
pub const DEFAULT_MAX_EXECUTION_TIME: Duration = Duration::from_secs(240);
/// The default minimum length of text that counts as an article.
pub const DEFAULT_MIN_CONTENT_LENGTH: usize = 100;
/// Marker written into Content when nothing could be fetched.
pub const FETCH_FAILURE_MARKER: &str = "（本文が取得できませんでした）";
