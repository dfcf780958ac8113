//! Integration tests against a live Postgres with pgvector. Run with:
//!   SITEKB_TEST_POSTGRES_URL=postgresql://localhost/sitekb_test \
//!     cargo test -p sitekb-storage -- --ignored

use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;

use sitekb_common::{
    BudgetDimension, BudgetLimits, Chunk, ChunkId, CrawlSession, Document, DocumentId, KbError,
    SessionCounters, SessionId, SessionState, SessionType, SiteId, TenantId, TenantScope,
};
use sitekb_storage::{AnnQuery, BudgetStore, FtsQuery, IndexHint, PostgresStore};

const DIM: usize = 1536;

async fn store() -> PostgresStore {
    let url = std::env::var("SITEKB_TEST_POSTGRES_URL")
        .unwrap_or_else(|_| "postgresql://localhost/sitekb_test".to_string());
    let store = PostgresStore::new(&url, 5).await.expect("postgres unavailable");
    store.run_migrations(DIM).await.expect("migrations failed");
    store
}

fn fresh_scope() -> TenantScope {
    TenantScope::new(
        TenantId::new(format!("tenant-{}", Uuid::new_v4())),
        SiteId::new(format!("site-{}", Uuid::new_v4())),
    )
    .unwrap()
}

fn unit_vector(hot: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    v[hot % DIM] = 1.0;
    v
}

fn document(scope: &TenantScope, url: &str) -> Document {
    Document {
        id: DocumentId::new(),
        tenant_id: scope.tenant_id.clone(),
        site_id: scope.site_id.clone(),
        canonical_url: url.to_string(),
        title: Some("Test page".to_string()),
        lastmod: None,
        etag: None,
        last_modified_header: None,
        locale: Some("en".to_string()),
        content_hash: format!("doc-{url}"),
        fetched_at: Utc::now(),
    }
}

fn chunk(scope: &TenantScope, doc: &Document, index: i32, text: &str, hot: usize) -> Chunk {
    Chunk {
        id: ChunkId::new(),
        tenant_id: scope.tenant_id.clone(),
        site_id: scope.site_id.clone(),
        document_id: doc.id,
        chunk_index: index,
        content: text.to_string(),
        cleaned_content: text.to_string(),
        content_hash: format!("{}-{}", scope.site_id, sitekb_extract_hash(text)),
        token_count: (text.len() / 4) as i32,
        locale: Some("en".to_string()),
        section: None,
        heading: None,
        selector: None,
        metadata: HashMap::new(),
        embedding: Some(unit_vector(hot)),
    }
}

// Local stand-in so this crate does not depend on the extract crate.
fn sitekb_extract_hash(text: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[tokio::test]
#[ignore]
async fn tenant_isolation_holds_for_ann_search() {
    let store = store().await;
    let scope_a = fresh_scope();
    let scope_b = fresh_scope();

    for (scope, hot) in [(&scope_a, 1), (&scope_b, 2)] {
        let doc = document(scope, "https://example.test/page");
        store.upsert_document(&doc).await.unwrap();
        let chunks = vec![chunk(scope, &doc, 0, "tenant private content", hot)];
        store.upsert_chunks(&chunks).await.unwrap();
    }

    let hits = store
        .ann_search(&AnnQuery {
            scope: scope_a.clone(),
            locale: None,
            embedding: unit_vector(2), // B's direction on purpose
            k: 10,
            index_hint: IndexHint::Hnsw,
        })
        .await
        .unwrap();

    // Even querying with B's exact vector, only A's rows come back.
    assert_eq!(hits.len(), 1);
    assert!(hits.iter().all(|h| h.document_url == "https://example.test/page"));
}

#[tokio::test]
#[ignore]
async fn chunk_upsert_is_idempotent_by_content_hash() {
    let store = store().await;
    let scope = fresh_scope();
    let doc = document(&scope, "https://example.test/a");
    store.upsert_document(&doc).await.unwrap();

    let chunks = vec![
        chunk(&scope, &doc, 0, "first paragraph of stable content", 3),
        chunk(&scope, &doc, 1, "second paragraph of stable content", 4),
    ];
    let (inserted, skipped) = store.upsert_chunks(&chunks).await.unwrap();
    assert_eq!((inserted, skipped), (2, 0));

    // Same hashes again: all skipped, nothing re-embedded.
    let again: Vec<Chunk> = chunks
        .iter()
        .map(|c| Chunk {
            id: ChunkId::new(),
            ..c.clone()
        })
        .collect();
    let (inserted, skipped) = store.upsert_chunks(&again).await.unwrap();
    assert_eq!((inserted, skipped), (0, 2));

    let hashes: Vec<String> = chunks.iter().map(|c| c.content_hash.clone()).collect();
    let embeddings = store.get_embeddings_by_hashes(&scope, &hashes).await.unwrap();
    assert_eq!(embeddings.len(), 2);
}

#[tokio::test]
#[ignore]
async fn fts_finds_cleaned_content() {
    let store = store().await;
    let scope = fresh_scope();
    let doc = document(&scope, "https://example.test/refunds");
    store.upsert_document(&doc).await.unwrap();
    store
        .upsert_chunks(&[chunk(
            &scope,
            &doc,
            0,
            "our refund policy covers thirty days",
            5,
        )])
        .await
        .unwrap();

    let hits = store
        .fts_search(&FtsQuery {
            scope: scope.clone(),
            query: "refund policy".to_string(),
            k: 10,
            locale: Some("en".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].score > 0.0);
}

#[tokio::test]
#[ignore]
async fn second_active_session_is_rejected_with_active_id() {
    let store = store().await;
    let scope = fresh_scope();

    let first = CrawlSession {
        id: SessionId::new(),
        tenant_id: scope.tenant_id.clone(),
        site_id: scope.site_id.clone(),
        session_type: SessionType::Delta,
        state: SessionState::Discovering,
        counters: SessionCounters::default(),
        started_at: Utc::now(),
        finished_at: None,
        failure_reason: None,
    };
    store.insert_session(&first).await.unwrap();

    let second = CrawlSession {
        id: SessionId::new(),
        ..first.clone()
    };
    match store.insert_session(&second).await {
        Err(KbError::SessionConflict { active }) => {
            assert_eq!(active, first.id.to_string());
        }
        other => panic!("expected SessionConflict, got {other:?}"),
    }

    // Finishing the first frees the slot.
    store
        .update_session(
            first.id,
            SessionState::Done,
            &SessionCounters::default(),
            None,
            Some(Utc::now()),
        )
        .await
        .unwrap();
    store.insert_session(&second).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn budget_record_is_monotone_and_reset_applies_once() {
    let store = store().await;
    let scope = fresh_scope();
    let budgets = BudgetStore::new(store.pool().clone());

    let limits = BudgetLimits {
        tokens_per_month: 100.0,
        actions_per_day: 10.0,
        api_calls_per_hour: 10.0,
        voice_minutes_per_month: 10.0,
        storage_bytes: 1000.0,
    };
    let created = budgets.get_or_create(&scope, &limits, Utc::now()).await.unwrap();
    assert_eq!(created.usage.tokens, 0.0);

    let total = budgets
        .record_delta(&scope, BudgetDimension::Tokens, 30.0)
        .await
        .unwrap();
    assert_eq!(total, 30.0);
    let total = budgets
        .record_delta(&scope, BudgetDimension::Tokens, 12.5)
        .await
        .unwrap();
    assert_eq!(total, 42.5);

    // Gauge semantics for storage: high-water mark.
    let gauge = budgets.record_gauge(&scope, 500.0).await.unwrap();
    assert_eq!(gauge, 500.0);
    let gauge = budgets.record_gauge(&scope, 250.0).await.unwrap();
    assert_eq!(gauge, 500.0);

    // Conditional reset: first caller wins, the replay loses.
    let stored = budgets.get(&scope).await.unwrap().unwrap().reset_dates.tokens;
    let new_start = stored + chrono::Duration::days(31);
    assert!(budgets
        .reset_window(&scope, BudgetDimension::Tokens, stored, new_start)
        .await
        .unwrap());
    assert!(!budgets
        .reset_window(&scope, BudgetDimension::Tokens, stored, new_start)
        .await
        .unwrap());

    let after = budgets.get(&scope).await.unwrap().unwrap();
    assert_eq!(after.usage.tokens, 0.0);
    assert_eq!(after.usage.storage_bytes, 500.0, "gauge survives window reset");
}

#[tokio::test]
#[ignore]
async fn store_level_hybrid_fusion_merges_both_lists() {
    let store = store().await;
    let scope = fresh_scope();
    let doc = document(&scope, "https://example.test/mixed");
    store.upsert_document(&doc).await.unwrap();
    store
        .upsert_chunks(&[
            chunk(&scope, &doc, 0, "refund policy and return windows", 7),
            chunk(&scope, &doc, 1, "careers at the widget factory", 8),
        ])
        .await
        .unwrap();

    let hits = store
        .hybrid_search(
            &AnnQuery {
                scope: scope.clone(),
                locale: None,
                embedding: unit_vector(7),
                k: 10,
                index_hint: IndexHint::Hnsw,
            },
            &FtsQuery {
                scope: scope.clone(),
                query: "refund policy".to_string(),
                k: 10,
                locale: Some("en".to_string()),
            },
            0.6,
        )
        .await
        .unwrap();

    assert!(!hits.is_empty());
    // The refund chunk appears in both lists and must rank first.
    assert!(hits[0].content.contains("refund"));
}
