use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use sitekb_common::{KbError, SiteId, TenantId, TenantScope};
use sitekb_retrieval::{SearchFilters, SearchRequest, SearchStrategy};

use crate::server::AppState;
use crate::types::{error_reply, ErrorResponse, SearchRequestBody, SearchResponseBody};

fn parse_strategies(names: &[String]) -> Result<Vec<SearchStrategy>, KbError> {
    names
        .iter()
        .map(|name| match name.as_str() {
            "vector" => Ok(SearchStrategy::Vector),
            "fulltext" => Ok(SearchStrategy::Fulltext),
            "structured" => Ok(SearchStrategy::Structured),
            other => Err(KbError::InvalidInput(format!("unknown strategy: {other}"))),
        })
        .collect()
}

/// Hybrid search over a site's corpus. Always answers: fused results, a
/// degraded partial fusion, or an explicit budget/backend failure code.
#[utoipa::path(
    post,
    path = "/search",
    tag = "search",
    request_body = SearchRequestBody,
    responses(
        (status = 200, description = "Fused search results", body = SearchResponseBody),
        (status = 429, description = "Budget exhausted", body = ErrorResponse),
        (status = 504, description = "Every strategy timed out", body = ErrorResponse)
    )
)]
#[instrument(skip(state, req), fields(tenant = %req.tenant_id, site = %req.site_id))]
pub async fn search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequestBody>,
) -> Result<Json<SearchResponseBody>, (StatusCode, Json<ErrorResponse>)> {
    let scope = TenantScope::new(TenantId::new(&req.tenant_id), SiteId::new(&req.site_id))
        .map_err(error_reply)?;

    let strategies = match &req.strategies {
        Some(names) if !names.is_empty() => parse_strategies(names).map_err(error_reply)?,
        _ => SearchStrategy::DEFAULT.to_vec(),
    };

    let request = SearchRequest {
        scope,
        query: req.query,
        top_k: req.top_k,
        strategies,
        filters: SearchFilters {
            locale: req.locale,
            section: req.section,
            ..SearchFilters::default()
        },
        fusion_weights: None,
    };

    let response = state
        .search
        .search(request, &CancellationToken::new())
        .await
        .map_err(error_reply)?;

    Ok(Json(response.into()))
}
