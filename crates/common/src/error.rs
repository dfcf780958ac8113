use thiserror::Error;

/// Engine-wide error taxonomy. Every variant maps onto a stable wire code
/// surfaced by the API layer; subsystems classify and enrich, the
/// orchestrator decides retry vs skip vs fail.
#[derive(Error, Debug)]
pub enum KbError {
    #[error("Tenant scope missing or empty")]
    TenantScopeMissing,

    #[error("Budget exceeded for {dimension}: requested {requested}, remaining {remaining}")]
    BudgetExceeded {
        dimension: String,
        requested: f64,
        remaining: f64,
    },

    #[error("Crawl session conflict: session {active} is already running for this site")]
    SessionConflict { active: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timeout during {0}")]
    Timeout(String),

    #[error("Transient I/O error: {0}")]
    Transient(String),

    #[error("Fetch failed for {url}: status {status}")]
    Fetch { url: String, status: u16 },

    #[error("Extraction error ({kind}): {detail}")]
    Extract { kind: String, detail: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Embedding provider error: {0}")]
    Embedding(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KbError {
    /// Stable wire code for API responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            KbError::TenantScopeMissing => "FAIL_TENANT_SCOPE_MISSING",
            KbError::BudgetExceeded { .. } => "FAIL_BUDGET_EXCEEDED",
            KbError::SessionConflict { .. } => "FAIL_SESSION_CONFLICT",
            KbError::Cancelled => "ERR_CANCELLED",
            KbError::Timeout(_) => "ERR_TIMEOUT",
            KbError::Transient(_) => "ERR_TRANSIENT_IO",
            KbError::Fetch { .. } => "ERR_FETCH_FAILED",
            KbError::Extract { .. } => "ERR_EXTRACT_FAILED",
            KbError::Backend(_) => "ERR_BACKEND",
            KbError::Embedding(_) => "ERR_EMBEDDING",
            KbError::Config(_) => "ERR_CONFIG",
            KbError::InvalidInput(_) => "ERR_INVALID_INPUT",
            KbError::NotFound(_) => "ERR_NOT_FOUND",
            KbError::Io(_) => "ERR_IO",
            KbError::Serialization(_) => "ERR_SERIALIZATION",
        }
    }

    /// Whether the operation may be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, KbError::Transient(_) | KbError::Timeout(_))
    }
}

impl From<anyhow::Error> for KbError {
    fn from(err: anyhow::Error) -> Self {
        KbError::Backend(err.to_string())
    }
}

impl From<reqwest::Error> for KbError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            KbError::Timeout(err.to_string())
        } else if err.is_connect() {
            KbError::Transient(err.to_string())
        } else {
            KbError::Backend(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, KbError>;
