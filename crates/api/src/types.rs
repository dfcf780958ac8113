use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use sitekb_common::{
    ActionDescriptor, BudgetLimits, KbError, OveragePolicy, ResourceBudget, SessionCounters,
    SessionState, SessionType,
};
use sitekb_retrieval::{SearchHit, SearchResponse};

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: &str) -> Self {
        Self {
            error: error.into(),
            code: Some(code.to_string()),
            timestamp: Utc::now(),
        }
    }
}

/// Map engine errors onto HTTP status + wire code.
pub fn status_for(err: &KbError) -> axum::http::StatusCode {
    use axum::http::StatusCode;
    match err {
        KbError::TenantScopeMissing => StatusCode::BAD_REQUEST,
        KbError::InvalidInput(_) | KbError::Config(_) => StatusCode::BAD_REQUEST,
        KbError::NotFound(_) => StatusCode::NOT_FOUND,
        KbError::SessionConflict { .. } => StatusCode::CONFLICT,
        KbError::BudgetExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        KbError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        KbError::Cancelled => StatusCode::CONFLICT,
        KbError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_reply(err: KbError) -> (axum::http::StatusCode, axum::Json<ErrorResponse>) {
    let status = status_for(&err);
    let code = err.code();
    (status, axum::Json(ErrorResponse::new(err.to_string(), code)))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CrawlRequest {
    pub tenant_id: String,
    pub site_id: String,
    pub base_url: String,
    /// "full" or "delta"; defaults to delta.
    pub session_type: Option<String>,
}

impl CrawlRequest {
    pub fn parsed_type(&self) -> Result<SessionType, KbError> {
        match self.session_type.as_deref() {
            None | Some("delta") => Ok(SessionType::Delta),
            Some("full") => Ok(SessionType::Full),
            Some(other) => Err(KbError::InvalidInput(format!(
                "unknown session type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CrawlResponse {
    pub session_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub state: SessionState,
    pub counters: SessionCounters,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SearchRequestBody {
    pub tenant_id: String,
    pub site_id: String,
    pub query: String,
    pub top_k: Option<usize>,
    /// Subset of {vector, fulltext, structured}; defaults to all three.
    pub strategies: Option<Vec<String>>,
    pub locale: Option<String>,
    pub section: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SearchHitBody {
    pub chunk_id: String,
    pub content: String,
    pub url: String,
    pub title: Option<String>,
    pub section: Option<String>,
    pub heading: Option<String>,
    pub score: f64,
    #[schema(value_type = Object)]
    pub metadata: serde_json::Value,
    pub actions: Vec<ActionDescriptor>,
    #[schema(value_type = Vec<Object>)]
    pub breakdown: serde_json::Value,
}

impl From<SearchHit> for SearchHitBody {
    fn from(hit: SearchHit) -> Self {
        Self {
            chunk_id: hit.chunk_id.to_string(),
            content: hit.content,
            url: hit.url,
            title: hit.title,
            section: hit.section,
            heading: hit.heading,
            score: hit.score,
            metadata: serde_json::to_value(hit.metadata).unwrap_or_default(),
            actions: hit.actions,
            breakdown: serde_json::to_value(hit.breakdown).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SearchResponseBody {
    pub results: Vec<SearchHitBody>,
    pub session_version: i64,
    pub served_from_cache: bool,
    pub served_stale: bool,
    pub degraded: bool,
    pub warning: Option<String>,
}

impl From<SearchResponse> for SearchResponseBody {
    fn from(response: SearchResponse) -> Self {
        Self {
            results: response.results.into_iter().map(Into::into).collect(),
            session_version: response.session_version,
            served_from_cache: response.served_from_cache,
            served_stale: response.served_stale,
            degraded: response.degraded,
            warning: response.warning,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BudgetResponse {
    pub budget: ResourceBudget,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BudgetPatchRequest {
    pub tenant_id: String,
    pub site_id: String,
    pub limits: BudgetLimits,
    pub overage_policy: Option<OveragePolicy>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OptimizationsResponse {
    #[schema(value_type = Vec<Object>)]
    pub suggestions: serde_json::Value,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct InvalidateCacheRequest {
    pub tenant_id: String,
    /// When absent, every site of the tenant is invalidated.
    pub site_id: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ReindexRequest {
    /// "hnsw", "ivfflat", or "exact".
    pub kind: String,
    #[serde(default)]
    pub concurrent: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StatsResponse {
    pub document_count: i64,
    pub chunk_count: i64,
    pub entity_count: i64,
    pub avg_chunk_tokens: f64,
    pub index_kind: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
