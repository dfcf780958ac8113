use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::{info, instrument};

use sitekb_common::{KbError, SiteId, TenantId, TenantScope};
use sitekb_storage::ReindexKind;

use crate::server::AppState;
use crate::types::{
    error_reply, ErrorResponse, HealthResponse, InvalidateCacheRequest, ReindexRequest,
    StatsResponse,
};

#[utoipa::path(
    get,
    path = "/health",
    tag = "ops",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Rebuild (or drop) the ANN index.
#[utoipa::path(
    post,
    path = "/reindex",
    tag = "ops",
    request_body = ReindexRequest,
    responses((status = 200, description = "Reindex complete", body = HealthResponse))
)]
#[instrument(skip(state))]
pub async fn reindex(
    State(state): State<AppState>,
    Json(req): Json<ReindexRequest>,
) -> Result<Json<HealthResponse>, (StatusCode, Json<ErrorResponse>)> {
    let kind = match req.kind.as_str() {
        "hnsw" | "ann" => ReindexKind::Hnsw,
        "ivfflat" => ReindexKind::IvfFlat,
        "exact" => ReindexKind::Exact,
        other => {
            return Err(error_reply(KbError::InvalidInput(format!(
                "unknown index kind: {other}"
            ))))
        }
    };
    state
        .store
        .reindex(kind, req.concurrent)
        .await
        .map_err(error_reply)?;
    info!(kind = %req.kind, concurrent = req.concurrent, "reindex finished");
    Ok(Json(HealthResponse {
        status: "reindexed".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

/// Drop cached search results for one site, or for every site of a tenant
/// when `site_id` is absent.
#[utoipa::path(
    post,
    path = "/cache/invalidate",
    tag = "ops",
    request_body = InvalidateCacheRequest,
    responses((status = 200, description = "Cache entries dropped", body = HealthResponse))
)]
#[instrument(skip(state, req), fields(tenant = %req.tenant_id, site = ?req.site_id))]
pub async fn invalidate_cache(
    State(state): State<AppState>,
    Json(req): Json<InvalidateCacheRequest>,
) -> Result<Json<HealthResponse>, (StatusCode, Json<ErrorResponse>)> {
    match &req.site_id {
        Some(site_id) => {
            let scope = TenantScope::new(TenantId::new(&req.tenant_id), SiteId::new(site_id))
                .map_err(error_reply)?;
            state.search.invalidate_scope(&scope).await.map_err(error_reply)?;
        }
        None => {
            if req.tenant_id.trim().is_empty() {
                return Err(error_reply(KbError::TenantScopeMissing));
            }
            state
                .search
                .invalidate_tenant(&TenantId::new(&req.tenant_id))
                .await
                .map_err(error_reply)?;
        }
    }
    info!("cache invalidated");
    Ok(Json(HealthResponse {
        status: "invalidated".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

#[utoipa::path(
    get,
    path = "/stats/{tenant_id}/{site_id}",
    tag = "ops",
    responses((status = 200, description = "Corpus statistics", body = StatsResponse))
)]
#[instrument(skip(state))]
pub async fn stats(
    State(state): State<AppState>,
    Path((tenant_id, site_id)): Path<(String, String)>,
) -> Result<Json<StatsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let scope = TenantScope::new(TenantId::new(tenant_id), SiteId::new(site_id))
        .map_err(error_reply)?;
    let stats = state.store.stats(&scope).await.map_err(error_reply)?;
    Ok(Json(StatsResponse {
        document_count: stats.document_count,
        chunk_count: stats.chunk_count,
        entity_count: stats.entity_count,
        avg_chunk_tokens: stats.avg_chunk_tokens,
        index_kind: stats.index_kind,
    }))
}
