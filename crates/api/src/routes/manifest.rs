use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::instrument;

use sitekb_common::{KbError, SiteId, SiteManifest, TenantId, TenantScope};

use crate::server::AppState;
use crate::types::{error_reply, ErrorResponse};

/// Latest compiled action manifest for a site.
#[utoipa::path(
    get,
    path = "/manifest/{tenant_id}/{site_id}",
    tag = "manifest",
    responses(
        (status = 200, description = "Latest manifest", body = SiteManifest),
        (status = 404, description = "Site never crawled", body = ErrorResponse)
    )
)]
#[instrument(skip(state))]
pub async fn get_manifest(
    State(state): State<AppState>,
    Path((tenant_id, site_id)): Path<(String, String)>,
) -> Result<Json<SiteManifest>, (StatusCode, Json<ErrorResponse>)> {
    let scope = TenantScope::new(TenantId::new(tenant_id), SiteId::new(site_id))
        .map_err(error_reply)?;

    let manifest = state
        .store
        .get_manifest(&scope)
        .await
        .map_err(error_reply)?
        .ok_or_else(|| error_reply(KbError::NotFound(format!("manifest for {scope}"))))?;

    Ok(Json(manifest))
}
