use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::{info, instrument};
use uuid::Uuid;

use sitekb_common::{KbError, SessionId, SiteId, TenantId, TenantScope};

use crate::server::AppState;
use crate::types::{error_reply, CrawlRequest, CrawlResponse, ErrorResponse, SessionStatusResponse};

type Reply<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

fn scope_of(tenant_id: &str, site_id: &str) -> Result<TenantScope, (StatusCode, Json<ErrorResponse>)> {
    TenantScope::new(TenantId::new(tenant_id), SiteId::new(site_id)).map_err(error_reply)
}

/// Trigger a crawl session. A second concurrent session for the same site
/// is rejected with 409 and the running session's id.
#[utoipa::path(
    post,
    path = "/crawl",
    tag = "crawl",
    request_body = CrawlRequest,
    responses(
        (status = 200, description = "Session started", body = CrawlResponse),
        (status = 409, description = "A session is already running", body = ErrorResponse)
    )
)]
#[instrument(skip(state, req), fields(tenant = %req.tenant_id, site = %req.site_id))]
pub async fn start_crawl(
    State(state): State<AppState>,
    Json(req): Json<CrawlRequest>,
) -> Reply<CrawlResponse> {
    let scope = scope_of(&req.tenant_id, &req.site_id)?;
    let session_type = req.parsed_type().map_err(error_reply)?;

    let session_id = state
        .orchestrator
        .start_session(scope, req.base_url.clone(), session_type)
        .await
        .map_err(error_reply)?;

    info!(session = %session_id, "crawl accepted");
    Ok(Json(CrawlResponse {
        session_id: session_id.to_string(),
    }))
}

#[utoipa::path(
    get,
    path = "/crawl/{tenant_id}/{site_id}/{session_id}",
    tag = "crawl",
    responses(
        (status = 200, description = "Session state and counters", body = SessionStatusResponse),
        (status = 404, description = "Unknown session", body = ErrorResponse)
    )
)]
#[instrument(skip(state))]
pub async fn session_status(
    State(state): State<AppState>,
    Path((tenant_id, site_id, session_id)): Path<(String, String, String)>,
) -> Reply<SessionStatusResponse> {
    let scope = scope_of(&tenant_id, &site_id)?;
    let session_id = session_id
        .parse::<Uuid>()
        .map(SessionId)
        .map_err(|_| error_reply(KbError::InvalidInput("bad session id".to_string())))?;

    let session = state
        .orchestrator
        .session_status(&scope, session_id)
        .await
        .map_err(error_reply)?
        .ok_or_else(|| error_reply(KbError::NotFound(format!("session {session_id}"))))?;

    Ok(Json(SessionStatusResponse {
        session_id: session.id.to_string(),
        state: session.state,
        counters: session.counters,
        started_at: session.started_at,
        finished_at: session.finished_at,
        failure_reason: session.failure_reason,
    }))
}

/// Cancel the active session for a site. Already-committed writes are
/// preserved.
#[utoipa::path(
    delete,
    path = "/crawl/{tenant_id}/{site_id}",
    tag = "crawl",
    responses(
        (status = 200, description = "Cancellation signalled", body = CrawlResponse),
        (status = 404, description = "No active session", body = ErrorResponse)
    )
)]
#[instrument(skip(state))]
pub async fn cancel_crawl(
    State(state): State<AppState>,
    Path((tenant_id, site_id)): Path<(String, String)>,
) -> Reply<CrawlResponse> {
    let scope = scope_of(&tenant_id, &site_id)?;
    match state.orchestrator.cancel_session(&scope) {
        Some(session_id) => Ok(Json(CrawlResponse {
            session_id: session_id.to_string(),
        })),
        None => Err(error_reply(KbError::NotFound(format!(
            "no active session for {scope}"
        )))),
    }
}
