use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use sitekb_budget::BudgetController;
use sitekb_common::embedding::{EmbeddingProvider, HttpEmbeddingProvider};
use sitekb_common::SystemConfig;
use sitekb_crawler::CrawlOrchestrator;
use sitekb_retrieval::{HybridSearchEngine, TieredCache};
use sitekb_storage::{BudgetStore, PostgresStore, RedisCache};

use crate::server::AppState;

/// Wire the whole engine from configuration: storage + migrations, caches,
/// embedding provider, budget controller (with its background resetter),
/// search engine, and the crawl orchestrator with its cache-invalidation
/// completion hook. Used by the server binary and the CLI's `serve`
/// command. Cancel the returned token on shutdown to stop the resetter.
pub async fn build_state(config: &SystemConfig) -> anyhow::Result<(AppState, CancellationToken)> {
    let store = Arc::new(
        PostgresStore::new(&config.storage.postgres_url, config.storage.max_connections)
            .await
            .context("failed to connect to Postgres")?,
    );
    store
        .run_migrations(config.embedding.model.dimensions())
        .await
        .context("migrations failed")?;

    let redis = match &config.storage.redis_url {
        Some(url) => match RedisCache::new(url).await {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!(error = %e, "Redis unavailable, running with L1 cache only");
                None
            }
        },
        None => None,
    };

    let embedder: Arc<dyn EmbeddingProvider> =
        Arc::new(HttpEmbeddingProvider::new(&config.embedding)?);

    let budget = Arc::new(BudgetController::new(
        BudgetStore::new(store.pool().clone()),
        config.budget.clone(),
    ));
    let background_cancel = CancellationToken::new();
    tokio::spawn(budget.clone().run_resetter(background_cancel.clone()));

    let cache = TieredCache::new(
        config.retrieval.l1_capacity,
        Duration::from_secs(config.retrieval.l2_ttl_secs),
        Duration::from_secs(config.retrieval.swr_secs),
        redis,
    );
    let search = Arc::new(HybridSearchEngine::new(
        store.clone(),
        cache,
        embedder.clone(),
        budget.clone(),
        config.retrieval.clone(),
    ));

    let orchestrator = Arc::new(CrawlOrchestrator::new(config, store.clone(), embedder)?);
    // Completed crawls bump the corpus version; drop the scoped cache so
    // searches observe the new corpus immediately.
    let search_for_hook = search.clone();
    orchestrator
        .set_completion_hook(Arc::new(move |scope| {
            let search = search_for_hook.clone();
            async move {
                if let Err(e) = search.invalidate_scope(&scope).await {
                    warn!(scope = %scope, error = %e, "cache invalidation failed");
                }
            }
            .boxed()
        }))
        .await;

    let state = AppState {
        store,
        orchestrator,
        search,
        budget,
    };
    Ok((state, background_cancel))
}
