use sqlx::PgPool;
use tracing::info;

use sitekb_common::Result;

use crate::postgres::map_sqlx_err;

/// Schema DDL, templated with the embedding dimension. Idempotent; run at
/// startup before any store operation.
fn statements(dimension: usize) -> Vec<String> {
    vec![
        "CREATE EXTENSION IF NOT EXISTS vector".to_string(),
        "CREATE TABLE IF NOT EXISTS documents (
            id UUID PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            site_id TEXT NOT NULL,
            canonical_url TEXT NOT NULL,
            title TEXT,
            lastmod TIMESTAMPTZ,
            etag TEXT,
            last_modified TEXT,
            locale TEXT,
            content_hash TEXT NOT NULL,
            fetched_at TIMESTAMPTZ NOT NULL,
            UNIQUE (tenant_id, site_id, canonical_url)
        )"
        .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_documents_scope
            ON documents (tenant_id, site_id)"
            .to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS chunks (
                id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                site_id TEXT NOT NULL,
                document_id UUID NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                cleaned_content TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                locale TEXT,
                section TEXT,
                heading TEXT,
                selector TEXT,
                metadata_json JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                embedding vector({dimension}),
                embedding_json TEXT,
                UNIQUE (document_id, chunk_index),
                UNIQUE (site_id, content_hash)
            )"
        ),
        "CREATE INDEX IF NOT EXISTS idx_chunks_scope
            ON chunks (tenant_id, site_id)"
            .to_string(),
        // The match predicate in fts_search queries this same `simple`
        // tsvector; locale regconfigs are used for ranking only, so one
        // index serves every locale.
        "CREATE INDEX IF NOT EXISTS idx_chunks_fts
            ON chunks USING GIN (to_tsvector('simple', cleaned_content))"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_chunks_embedding_hnsw
            ON chunks USING hnsw (embedding vector_cosine_ops)"
            .to_string(),
        "CREATE TABLE IF NOT EXISTS structured_entities (
            id UUID PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            site_id TEXT NOT NULL,
            document_id UUID NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
            entity_type TEXT NOT NULL,
            properties_json JSONB NOT NULL,
            confidence REAL NOT NULL,
            labels TEXT[] NOT NULL DEFAULT '{}'
        )"
        .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_entities_scope_type
            ON structured_entities (tenant_id, site_id, entity_type)"
            .to_string(),
        "CREATE TABLE IF NOT EXISTS site_manifests (
            tenant_id TEXT NOT NULL,
            site_id TEXT NOT NULL,
            version BIGINT NOT NULL,
            generated_at TIMESTAMPTZ NOT NULL,
            manifest_json JSONB NOT NULL,
            PRIMARY KEY (tenant_id, site_id)
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS crawl_sessions (
            id UUID PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            site_id TEXT NOT NULL,
            session_type TEXT NOT NULL,
            state TEXT NOT NULL,
            counters_json JSONB NOT NULL,
            failure_reason TEXT,
            started_at TIMESTAMPTZ NOT NULL,
            finished_at TIMESTAMPTZ
        )"
        .to_string(),
        // One active session per site, enforced by the database itself.
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_active
            ON crawl_sessions (tenant_id, site_id)
            WHERE state IN ('pending', 'discovering', 'fetching', 'processing')"
            .to_string(),
        "CREATE TABLE IF NOT EXISTS resource_budgets (
            tenant_id TEXT NOT NULL,
            site_id TEXT NOT NULL,
            limits_json JSONB NOT NULL,
            usage_json JSONB NOT NULL,
            reset_dates_json JSONB NOT NULL,
            overage_policy_json JSONB NOT NULL,
            PRIMARY KEY (tenant_id, site_id)
        )"
        .to_string(),
    ]
}

pub async fn run_migrations(pool: &PgPool, embedding_dimension: usize) -> Result<()> {
    for statement in statements(embedding_dimension) {
        sqlx::query(&statement)
            .execute(pool)
            .await
            .map_err(map_sqlx_err)?;
    }
    info!(dimension = embedding_dimension, "schema migrations applied");
    Ok(())
}
