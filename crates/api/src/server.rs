use std::sync::Arc;

use axum::routing::{delete, get, patch, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use sitekb_budget::BudgetController;
use sitekb_crawler::CrawlOrchestrator;
use sitekb_retrieval::HybridSearchEngine;
use sitekb_storage::PostgresStore;

use crate::openapi::ApiDoc;
use crate::routes;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<PostgresStore>,
    pub orchestrator: Arc<CrawlOrchestrator>,
    pub search: Arc<HybridSearchEngine>,
    pub budget: Arc<BudgetController>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/crawl", post(routes::crawl::start_crawl))
        .route(
            "/crawl/:tenant_id/:site_id/:session_id",
            get(routes::crawl::session_status),
        )
        .route(
            "/crawl/:tenant_id/:site_id",
            delete(routes::crawl::cancel_crawl),
        )
        .route("/search", post(routes::search::search))
        .route(
            "/manifest/:tenant_id/:site_id",
            get(routes::manifest::get_manifest),
        )
        .route("/budget/:tenant_id/:site_id", get(routes::budget::get_budget))
        .route("/budget", patch(routes::budget::patch_budget))
        .route(
            "/budget/:tenant_id/:site_id/optimizations",
            get(routes::budget::optimizations),
        )
        .route("/reindex", post(routes::admin::reindex))
        .route("/cache/invalidate", post(routes::admin::invalidate_cache))
        .route("/stats/:tenant_id/:site_id", get(routes::admin::stats))
        .route("/health", get(routes::admin::health))
        .merge(SwaggerUi::new("/api-docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

pub async fn run(state: AppState, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "API server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}
