use utoipa::OpenApi;

use crate::types;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "SiteKB Knowledge Base API",
        description = "Multi-tenant website knowledge base: crawl, search, manifests, budgets"
    ),
    paths(
        crate::routes::crawl::start_crawl,
        crate::routes::crawl::session_status,
        crate::routes::crawl::cancel_crawl,
        crate::routes::search::search,
        crate::routes::manifest::get_manifest,
        crate::routes::budget::get_budget,
        crate::routes::budget::patch_budget,
        crate::routes::budget::optimizations,
        crate::routes::admin::reindex,
        crate::routes::admin::invalidate_cache,
        crate::routes::admin::stats,
        crate::routes::admin::health,
    ),
    components(schemas(
        sitekb_common::TenantId,
        sitekb_common::SiteId,
        sitekb_common::SessionState,
        sitekb_common::SessionCounters,
        sitekb_common::SiteManifest,
        sitekb_common::ActionDescriptor,
        sitekb_common::ActionParameter,
        sitekb_common::ActionKind,
        sitekb_common::SideEffect,
        sitekb_common::RiskLevel,
        sitekb_common::Capability,
        sitekb_common::SecuritySettings,
        sitekb_common::PrivacySettings,
        sitekb_common::ResourceBudget,
        sitekb_common::BudgetLimits,
        sitekb_common::BudgetUsage,
        sitekb_common::ResetDates,
        sitekb_common::OveragePolicy,
        types::ErrorResponse,
        types::CrawlRequest,
        types::CrawlResponse,
        types::SessionStatusResponse,
        types::SearchRequestBody,
        types::SearchHitBody,
        types::SearchResponseBody,
        types::BudgetResponse,
        types::BudgetPatchRequest,
        types::OptimizationsResponse,
        types::InvalidateCacheRequest,
        types::ReindexRequest,
        types::StatsResponse,
        types::HealthResponse,
    ))
)]
pub struct ApiDoc;
