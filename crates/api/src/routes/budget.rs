use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::{info, instrument};

use sitekb_common::{SiteId, TenantId, TenantScope};

use crate::server::AppState;
use crate::types::{
    error_reply, BudgetPatchRequest, BudgetResponse, ErrorResponse, OptimizationsResponse,
};

type Reply<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

fn scope_of(tenant_id: String, site_id: String) -> Result<TenantScope, (StatusCode, Json<ErrorResponse>)> {
    TenantScope::new(TenantId::new(tenant_id), SiteId::new(site_id)).map_err(error_reply)
}

/// Current budget and usage for a pair; materializes tier defaults on
/// first sight.
#[utoipa::path(
    get,
    path = "/budget/{tenant_id}/{site_id}",
    tag = "budget",
    responses((status = 200, description = "Budget with usage", body = BudgetResponse))
)]
#[instrument(skip(state))]
pub async fn get_budget(
    State(state): State<AppState>,
    Path((tenant_id, site_id)): Path<(String, String)>,
) -> Reply<BudgetResponse> {
    let scope = scope_of(tenant_id, site_id)?;
    let budget = state.budget.get(&scope).await.map_err(error_reply)?;
    Ok(Json(BudgetResponse { budget }))
}

/// Update limits (and optionally the overage policy) for a pair.
#[utoipa::path(
    patch,
    path = "/budget",
    tag = "budget",
    request_body = BudgetPatchRequest,
    responses((status = 200, description = "Updated budget", body = BudgetResponse))
)]
#[instrument(skip(state, req), fields(tenant = %req.tenant_id, site = %req.site_id))]
pub async fn patch_budget(
    State(state): State<AppState>,
    Json(req): Json<BudgetPatchRequest>,
) -> Reply<BudgetResponse> {
    let scope = scope_of(req.tenant_id.clone(), req.site_id.clone())?;
    state
        .budget
        .update_limits(&scope, &req.limits, req.overage_policy.as_ref())
        .await
        .map_err(error_reply)?;
    info!(scope = %scope, "budget limits updated");

    let budget = state.budget.get(&scope).await.map_err(error_reply)?;
    Ok(Json(BudgetResponse { budget }))
}

/// Advisory usage optimizations, most impactful first.
#[utoipa::path(
    get,
    path = "/budget/{tenant_id}/{site_id}/optimizations",
    tag = "budget",
    responses((status = 200, description = "Suggestions", body = OptimizationsResponse))
)]
#[instrument(skip(state))]
pub async fn optimizations(
    State(state): State<AppState>,
    Path((tenant_id, site_id)): Path<(String, String)>,
) -> Reply<OptimizationsResponse> {
    let scope = scope_of(tenant_id, site_id)?;
    let suggestions = state
        .budget
        .generate_optimizations(&scope)
        .await
        .map_err(error_reply)?;
    Ok(Json(OptimizationsResponse {
        suggestions: serde_json::to_value(suggestions).unwrap_or_default(),
    }))
}
