//! End-to-end hybrid search against a live Postgres with pgvector.
//! Run with:
//!   SITEKB_TEST_POSTGRES_URL=postgresql://localhost/sitekb_test \
//!     cargo test -p sitekb-retrieval -- --ignored

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sitekb_budget::BudgetController;
use sitekb_common::embedding::{EmbeddingProvider, HashingEmbedder};
use sitekb_common::{
    BudgetConfig, BudgetDimension, BudgetLimits, Chunk, ChunkId, Document, DocumentId,
    EmbeddingModel, KbError, OveragePolicy, RetrievalConfig, SiteId, StructuredEntity, TenantId,
    TenantScope,
};
use sitekb_retrieval::{HybridSearchEngine, SearchRequest, TieredCache};
use sitekb_storage::{BudgetStore, PostgresStore};

const DIM: usize = 1536;

async fn store() -> Arc<PostgresStore> {
    let url = std::env::var("SITEKB_TEST_POSTGRES_URL")
        .unwrap_or_else(|_| "postgresql://localhost/sitekb_test".to_string());
    let store = PostgresStore::new(&url, 5).await.expect("postgres unavailable");
    store.run_migrations(DIM).await.expect("migrations failed");
    Arc::new(store)
}

fn fresh_scope() -> TenantScope {
    TenantScope::new(
        TenantId::new(format!("tenant-{}", Uuid::new_v4())),
        SiteId::new(format!("site-{}", Uuid::new_v4())),
    )
    .unwrap()
}

async fn engine(store: Arc<PostgresStore>) -> Arc<HybridSearchEngine> {
    let embedder: Arc<dyn EmbeddingProvider> =
        Arc::new(HashingEmbedder::new(EmbeddingModel::Small1536));
    let budget = Arc::new(BudgetController::new(
        BudgetStore::new(store.pool().clone()),
        BudgetConfig::default(),
    ));
    let cache = TieredCache::new(64, Duration::from_secs(60), Duration::from_secs(30), None);
    Arc::new(HybridSearchEngine::new(
        store,
        cache,
        embedder,
        budget,
        RetrievalConfig {
            search_timeout_ms: 5_000,
            ..RetrievalConfig::default()
        },
    ))
}

async fn seed_corpus(store: &PostgresStore, scope: &TenantScope) -> (ChunkId, ChunkId, ChunkId) {
    let embedder = HashingEmbedder::new(EmbeddingModel::Small1536);
    let texts = [
        ("https://acme.test/policies", "our refund policy lasts thirty days from purchase"),
        ("https://acme.test/faq", "refund questions answered: how refunds work and when"),
        ("https://acme.test/careers", "we are hiring engineers for the platform team"),
    ];

    let mut ids = Vec::new();
    for (index, (url, text)) in texts.iter().enumerate() {
        let doc = Document {
            id: DocumentId::new(),
            tenant_id: scope.tenant_id.clone(),
            site_id: scope.site_id.clone(),
            canonical_url: url.to_string(),
            title: Some(format!("Page {index}")),
            lastmod: None,
            etag: None,
            last_modified_header: None,
            locale: Some("en".to_string()),
            content_hash: format!("hash-{index}"),
            fetched_at: Utc::now(),
        };
        let chunk_id = ChunkId::new();
        let chunk = Chunk {
            id: chunk_id,
            tenant_id: scope.tenant_id.clone(),
            site_id: scope.site_id.clone(),
            document_id: doc.id,
            chunk_index: 0,
            content: text.to_string(),
            cleaned_content: text.to_string(),
            content_hash: format!("{}-{index}", scope.site_id),
            token_count: (text.len() / 4) as i32,
            locale: Some("en".to_string()),
            section: None,
            heading: None,
            selector: None,
            metadata: HashMap::new(),
            embedding: Some(embedder.embed(text).await.unwrap()),
        };
        // The FAQ page carries a structured entity mentioning refunds.
        let entities = if index == 1 {
            vec![StructuredEntity {
                id: Uuid::new_v4(),
                tenant_id: scope.tenant_id.clone(),
                site_id: scope.site_id.clone(),
                document_id: doc.id,
                entity_type: "FAQPage".to_string(),
                properties: serde_json::json!({
                    "mainEntity": [{"name": "How do refunds work?"}]
                }),
                confidence: 0.9,
                labels: vec!["faqpage".to_string()],
            }]
        } else {
            Vec::new()
        };
        store
            .replace_document_content(&doc, &[chunk], &entities)
            .await
            .unwrap();
        ids.push(chunk_id);
    }
    (ids[0], ids[1], ids[2])
}

#[tokio::test]
#[ignore]
async fn hybrid_query_ranks_structured_match_first() {
    let store = store().await;
    let scope = fresh_scope();
    let (c1, c2, c3) = seed_corpus(&store, &scope).await;
    let engine = engine(store).await;

    let response = engine
        .search(
            SearchRequest::new(scope.clone(), "refund policy"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let order: Vec<ChunkId> = response.results.iter().map(|r| r.chunk_id).collect();
    let position = |id: ChunkId| order.iter().position(|x| *x == id);

    // The FAQ chunk matches vector + fulltext + structured and must win.
    assert_eq!(position(c2), Some(0), "structured-boosted chunk first");
    let p1 = position(c1).expect("text-matching chunk present");
    if let Some(p3) = position(c3) {
        assert!(p1 < p3, "refund chunk outranks the unrelated one");
    }

    let top = &response.results[0];
    let systems: Vec<&str> = top.breakdown.iter().map(|b| b.system.as_str()).collect();
    assert!(systems.contains(&"vector"));
    assert!(systems.contains(&"fulltext"));
    assert!(systems.contains(&"structured"));
    assert!(!response.served_from_cache);

    // Identical fingerprint: second call is served from cache with the
    // same ordering.
    let cached = engine
        .search(
            SearchRequest::new(scope.clone(), "refund policy"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(cached.served_from_cache);
    let cached_order: Vec<ChunkId> = cached.results.iter().map(|r| r.chunk_id).collect();
    assert_eq!(order, cached_order);
}

#[tokio::test]
#[ignore]
async fn budget_exhaustion_denies_then_overage_allows_with_warning() {
    let store = store().await;
    let scope = fresh_scope();
    seed_corpus(&store, &scope).await;

    let budgets = BudgetStore::new(store.pool().clone());
    let limits = BudgetLimits {
        tokens_per_month: 100.0,
        actions_per_day: 1000.0,
        api_calls_per_hour: 1000.0,
        voice_minutes_per_month: 1000.0,
        storage_bytes: 1e9,
    };
    budgets.get_or_create(&scope, &limits, Utc::now()).await.unwrap();
    budgets
        .record_delta(&scope, BudgetDimension::Tokens, 99.0)
        .await
        .unwrap();

    let engine = engine(store.clone()).await;

    // Overage disallowed: the search fails and usage is untouched.
    let err = engine
        .search(
            SearchRequest::new(scope.clone(), "refund policy details"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, KbError::BudgetExceeded { .. }));
    assert_eq!(err.code(), "FAIL_BUDGET_EXCEEDED");
    let usage = budgets.get(&scope).await.unwrap().unwrap().usage.tokens;
    assert_eq!(usage, 99.0, "denied request must not mutate usage");

    // Allow overage: the query proceeds, usage exceeds the limit, and the
    // response carries a high-usage warning.
    budgets
        .update_limits(
            &scope,
            &limits,
            Some(&OveragePolicy {
                allow_overage: true,
                unit_costs: HashMap::new(),
            }),
        )
        .await
        .unwrap();

    let response = engine
        .search(
            SearchRequest::new(scope.clone(), "refund policy details"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(response.warning.as_deref(), Some("High usage"));

    let usage = budgets.get(&scope).await.unwrap().unwrap().usage.tokens;
    assert!(usage > 100.0, "overage recorded: {usage}");
}
