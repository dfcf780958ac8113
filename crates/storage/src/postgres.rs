use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pgvector::Vector;
use rand::Rng;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info, instrument, warn};

use sitekb_common::{
    Chunk, ChunkId, CrawlSession, Document, DocumentId, KbError, Result, SessionCounters,
    SessionId, SessionState, SessionType, SiteManifest, StructuredEntity, TenantScope,
};

/// Classify sqlx failures into the engine taxonomy. Connection-level
/// problems are transient and retried; everything else surfaces as a
/// backend error.
pub fn map_sqlx_err(err: sqlx::Error) -> KbError {
    match &err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            KbError::Transient(err.to_string())
        }
        sqlx::Error::Database(db) if db.code().as_deref() == Some("57P01") => {
            // admin_shutdown: the backend is restarting
            KbError::Transient(err.to_string())
        }
        sqlx::Error::RowNotFound => KbError::NotFound(err.to_string()),
        _ => KbError::Backend(err.to_string()),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Retry an operation on transient failures with exponential backoff and
/// jitter. Non-transient errors propagate immediately.
pub async fn with_retry<T, F, Fut>(what: &str, max_attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                attempt += 1;
                let jitter = rand::thread_rng().gen_range(0..100);
                let backoff = Duration::from_millis(100u64 * 2u64.pow(attempt) + jitter);
                warn!(what, attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "transient backend error, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// ANN index selection for a single query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexHint {
    /// HNSW graph traversal (high recall, default).
    #[default]
    Hnsw,
    /// Partition-clustered index (IVFFlat): faster to build, lower recall.
    Partitioned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReindexKind {
    /// Rebuild the HNSW graph index.
    Hnsw,
    /// Rebuild as IVFFlat (partition-clustered).
    IvfFlat,
    /// Drop ANN indexes entirely; queries fall back to exact scans.
    Exact,
}

#[derive(Debug, Clone)]
pub struct AnnQuery {
    pub scope: TenantScope,
    pub locale: Option<String>,
    pub embedding: Vec<f32>,
    pub k: usize,
    pub index_hint: IndexHint,
}

#[derive(Debug, Clone)]
pub struct FtsQuery {
    pub scope: TenantScope,
    pub query: String,
    pub k: usize,
    pub locale: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StructuredQuery {
    pub scope: TenantScope,
    pub terms: Vec<String>,
    pub k: usize,
}

/// A chunk returned from a ranked query, joined with its document.
#[derive(Debug, Clone)]
pub struct RankedChunk {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub content: String,
    pub cleaned_content: String,
    pub section: Option<String>,
    pub heading: Option<String>,
    pub selector: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub document_url: String,
    pub document_title: Option<String>,
    /// Similarity/rank score in [0, 1], higher is better.
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct DocumentValidators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_hash: String,
}

#[derive(Debug, Clone)]
pub struct StoreStats {
    pub document_count: i64,
    pub chunk_count: i64,
    pub entity_count: i64,
    pub avg_chunk_tokens: f64,
    pub index_kind: String,
}

/// Map a BCP-47-ish locale onto a Postgres text-search configuration.
/// Unknown locales fall back to `simple` (no stemming).
fn regconfig_for_locale(locale: Option<&str>) -> &'static str {
    match locale.map(|l| l.split(['-', '_']).next().unwrap_or(l)) {
        Some("en") => "english",
        Some("de") => "german",
        Some("fr") => "french",
        Some("es") => "spanish",
        Some("it") => "italian",
        Some("nl") => "dutch",
        Some("pt") => "portuguese",
        Some("sv") => "swedish",
        _ => "simple",
    }
}

pub struct PostgresStore {
    pool: PgPool,
    max_retries: u32,
}

impl PostgresStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(map_sqlx_err)?;
        Ok(Self {
            pool,
            max_retries: 3,
        })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            max_retries: 3,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self, embedding_dimension: usize) -> Result<()> {
        crate::migrations::run_migrations(&self.pool, embedding_dimension).await
    }

    // ── Documents ───────────────────────────────────────────────────────

    #[instrument(skip(self, document), fields(url = %document.canonical_url))]
    pub async fn upsert_document(&self, document: &Document) -> Result<DocumentId> {
        let row = sqlx::query(
            "INSERT INTO documents
                (id, tenant_id, site_id, canonical_url, title, lastmod, etag,
                 last_modified, locale, content_hash, fetched_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (tenant_id, site_id, canonical_url) DO UPDATE SET
                title = EXCLUDED.title,
                lastmod = EXCLUDED.lastmod,
                etag = EXCLUDED.etag,
                last_modified = EXCLUDED.last_modified,
                locale = EXCLUDED.locale,
                content_hash = EXCLUDED.content_hash,
                fetched_at = EXCLUDED.fetched_at
             RETURNING id",
        )
        .bind(document.id.0)
        .bind(document.tenant_id.as_str())
        .bind(document.site_id.as_str())
        .bind(&document.canonical_url)
        .bind(&document.title)
        .bind(document.lastmod)
        .bind(&document.etag)
        .bind(&document.last_modified_header)
        .bind(&document.locale)
        .bind(&document.content_hash)
        .bind(document.fetched_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(DocumentId(row.try_get("id").map_err(map_sqlx_err)?))
    }

    pub async fn get_document_by_url(
        &self,
        scope: &TenantScope,
        canonical_url: &str,
    ) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, tenant_id, site_id, canonical_url, title, lastmod, etag,
                    last_modified, locale, content_hash, fetched_at
             FROM documents
             WHERE tenant_id = $1 AND site_id = $2 AND canonical_url = $3",
        )
        .bind(scope.tenant_id.as_str())
        .bind(scope.site_id.as_str())
        .bind(canonical_url)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        row.map(document_from_row).transpose()
    }

    /// Stored HTTP validators for every document of a site, keyed by URL.
    /// Drives conditional fetching during a crawl.
    pub async fn get_document_validators(
        &self,
        scope: &TenantScope,
    ) -> Result<HashMap<String, DocumentValidators>> {
        let rows = sqlx::query(
            "SELECT canonical_url, etag, last_modified, content_hash
             FROM documents WHERE tenant_id = $1 AND site_id = $2",
        )
        .bind(scope.tenant_id.as_str())
        .bind(scope.site_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut validators = HashMap::with_capacity(rows.len());
        for row in rows {
            validators.insert(
                row.try_get::<String, _>("canonical_url").map_err(map_sqlx_err)?,
                DocumentValidators {
                    etag: row.try_get("etag").map_err(map_sqlx_err)?,
                    last_modified: row.try_get("last_modified").map_err(map_sqlx_err)?,
                    content_hash: row.try_get("content_hash").map_err(map_sqlx_err)?,
                },
            );
        }
        Ok(validators)
    }

    /// Delete a document and, by cascade, its chunks and entities.
    #[instrument(skip(self))]
    pub async fn delete_by_document(
        &self,
        scope: &TenantScope,
        document_id: DocumentId,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM documents WHERE id = $1 AND tenant_id = $2 AND site_id = $3",
        )
        .bind(document_id.0)
        .bind(scope.tenant_id.as_str())
        .bind(scope.site_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }

    // ── Chunks ──────────────────────────────────────────────────────────

    /// Transactional chunk upsert, idempotent by `(site_id, content_hash)`:
    /// a chunk whose hash already exists for the site is skipped, embedding
    /// untouched. Returns (inserted, skipped).
    #[instrument(skip(self, chunks), fields(count = chunks.len()))]
    pub async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<(u64, u64)> {
        if chunks.is_empty() {
            return Ok((0, 0));
        }
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        let mut inserted = 0u64;
        for chunk in chunks {
            let result = sqlx::query(
                "INSERT INTO chunks
                    (id, tenant_id, site_id, document_id, chunk_index, content,
                     cleaned_content, content_hash, token_count, locale, section,
                     heading, selector, metadata_json, embedding)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                 ON CONFLICT (site_id, content_hash) DO NOTHING",
            )
            .bind(chunk.id.0)
            .bind(chunk.tenant_id.as_str())
            .bind(chunk.site_id.as_str())
            .bind(chunk.document_id.0)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(&chunk.cleaned_content)
            .bind(&chunk.content_hash)
            .bind(chunk.token_count)
            .bind(&chunk.locale)
            .bind(&chunk.section)
            .bind(&chunk.heading)
            .bind(&chunk.selector)
            .bind(serde_json::to_value(&chunk.metadata)?)
            .bind(chunk.embedding.clone().map(Vector::from))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
            inserted += result.rows_affected();
        }
        tx.commit().await.map_err(map_sqlx_err)?;
        let skipped = chunks.len() as u64 - inserted;
        debug!(inserted, skipped, "chunk upsert complete");
        Ok((inserted, skipped))
    }

    /// One logical transaction for a processed page: upsert the document,
    /// drop chunks that no longer exist, insert the new set (hash-idempotent),
    /// and replace the document's structured entities.
    #[instrument(skip(self, document, chunks, entities), fields(url = %document.canonical_url, chunks = chunks.len()))]
    pub async fn replace_document_content(
        &self,
        document: &Document,
        chunks: &[Chunk],
        entities: &[StructuredEntity],
    ) -> Result<(u64, u64)> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        sqlx::query(
            "INSERT INTO documents
                (id, tenant_id, site_id, canonical_url, title, lastmod, etag,
                 last_modified, locale, content_hash, fetched_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (tenant_id, site_id, canonical_url) DO UPDATE SET
                title = EXCLUDED.title,
                lastmod = EXCLUDED.lastmod,
                etag = EXCLUDED.etag,
                last_modified = EXCLUDED.last_modified,
                locale = EXCLUDED.locale,
                content_hash = EXCLUDED.content_hash,
                fetched_at = EXCLUDED.fetched_at",
        )
        .bind(document.id.0)
        .bind(document.tenant_id.as_str())
        .bind(document.site_id.as_str())
        .bind(&document.canonical_url)
        .bind(&document.title)
        .bind(document.lastmod)
        .bind(&document.etag)
        .bind(&document.last_modified_header)
        .bind(&document.locale)
        .bind(&document.content_hash)
        .bind(document.fetched_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        // The document row may pre-exist under a different id; resolve the
        // canonical one so chunk rows attach to it.
        let doc_row = sqlx::query(
            "SELECT id FROM documents
             WHERE tenant_id = $1 AND site_id = $2 AND canonical_url = $3",
        )
        .bind(document.tenant_id.as_str())
        .bind(document.site_id.as_str())
        .bind(&document.canonical_url)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
        let document_id: uuid::Uuid = doc_row.try_get("id").map_err(map_sqlx_err)?;

        // Duplicate hashes within one page collapse to their first
        // occurrence; `(site_id, content_hash)` is unique anyway.
        let mut seen_hashes = std::collections::HashSet::new();
        let chunks: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| seen_hashes.insert(c.content_hash.as_str()))
            .collect();

        let hashes: Vec<String> = chunks.iter().map(|c| c.content_hash.clone()).collect();
        sqlx::query(
            "DELETE FROM chunks
             WHERE document_id = $1 AND tenant_id = $2 AND NOT (content_hash = ANY($3))",
        )
        .bind(document_id)
        .bind(document.tenant_id.as_str())
        .bind(&hashes)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        // Park surviving rows at negative indexes so re-numbering below can
        // never trip the `(document_id, chunk_index)` constraint.
        sqlx::query(
            "UPDATE chunks SET chunk_index = -(chunk_index + 1)
             WHERE document_id = $1 AND tenant_id = $2",
        )
        .bind(document_id)
        .bind(document.tenant_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        let mut inserted = 0u64;
        for chunk in &chunks {
            // Unchanged hash: move the existing row to its new position and
            // keep its embedding untouched.
            let updated = sqlx::query(
                "UPDATE chunks
                 SET chunk_index = $3, section = $4, heading = $5, selector = $6
                 WHERE document_id = $1 AND content_hash = $2",
            )
            .bind(document_id)
            .bind(&chunk.content_hash)
            .bind(chunk.chunk_index)
            .bind(&chunk.section)
            .bind(&chunk.heading)
            .bind(&chunk.selector)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
            if updated.rows_affected() > 0 {
                continue;
            }

            let result = sqlx::query(
                "INSERT INTO chunks
                    (id, tenant_id, site_id, document_id, chunk_index, content,
                     cleaned_content, content_hash, token_count, locale, section,
                     heading, selector, metadata_json, embedding)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                 ON CONFLICT (site_id, content_hash) DO NOTHING",
            )
            .bind(chunk.id.0)
            .bind(chunk.tenant_id.as_str())
            .bind(chunk.site_id.as_str())
            .bind(document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(&chunk.cleaned_content)
            .bind(&chunk.content_hash)
            .bind(chunk.token_count)
            .bind(&chunk.locale)
            .bind(&chunk.section)
            .bind(&chunk.heading)
            .bind(&chunk.selector)
            .bind(serde_json::to_value(&chunk.metadata)?)
            .bind(chunk.embedding.clone().map(Vector::from))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
            inserted += result.rows_affected();
        }

        // Any row still parked matched nothing above; it has no place in
        // the new layout.
        sqlx::query("DELETE FROM chunks WHERE document_id = $1 AND chunk_index < 0")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

        sqlx::query("DELETE FROM structured_entities WHERE document_id = $1 AND tenant_id = $2")
            .bind(document_id)
            .bind(document.tenant_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        for entity in entities {
            sqlx::query(
                "INSERT INTO structured_entities
                    (id, tenant_id, site_id, document_id, entity_type,
                     properties_json, confidence, labels)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(entity.id)
            .bind(entity.tenant_id.as_str())
            .bind(entity.site_id.as_str())
            .bind(document_id)
            .bind(&entity.entity_type)
            .bind(&entity.properties)
            .bind(entity.confidence)
            .bind(&entity.labels)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        }

        tx.commit().await.map_err(map_sqlx_err)?;
        let skipped = chunks.len() as u64 - inserted;
        Ok((inserted, skipped))
    }

    /// Embeddings for already-stored chunks, keyed by content hash. The
    /// delta-embedding path reuses these instead of calling the provider.
    pub async fn get_embeddings_by_hashes(
        &self,
        scope: &TenantScope,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f32>>> {
        if hashes.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT content_hash, embedding, embedding_json FROM chunks
             WHERE tenant_id = $1 AND site_id = $2 AND content_hash = ANY($3)",
        )
        .bind(scope.tenant_id.as_str())
        .bind(scope.site_id.as_str())
        .bind(hashes)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let hash: String = row.try_get("content_hash").map_err(map_sqlx_err)?;
            if let Some(vector) = decode_embedding(&row)? {
                map.insert(hash, vector);
            }
        }
        Ok(map)
    }

    // ── Ranked queries ──────────────────────────────────────────────────

    /// Approximate nearest-neighbor search, cosine distance. Rows are
    /// filtered by tenant and site before ranking; score is
    /// `1 − distance / 2` so it lands in [0, 1].
    #[instrument(skip(self, query), fields(scope = %query.scope, k = query.k))]
    pub async fn ann_search(&self, query: &AnnQuery) -> Result<Vec<RankedChunk>> {
        let query = query.clone();
        with_retry("ann_search", self.max_retries, move || {
            let query = query.clone();
            let pool = self.pool.clone();
            async move {
                let mut tx = pool.begin().await.map_err(map_sqlx_err)?;
                let tuning = match query.index_hint {
                    IndexHint::Hnsw => "SET LOCAL hnsw.ef_search = 100",
                    IndexHint::Partitioned => "SET LOCAL ivfflat.probes = 10",
                };
                // Tuning for an index that does not exist is a no-op.
                if let Err(e) = sqlx::query(tuning).execute(&mut *tx).await {
                    debug!(error = %e, "index tuning skipped");
                }

                let embedding = Vector::from(query.embedding.clone());
                let rows = sqlx::query(
                    "SELECT c.id, c.document_id, c.content, c.cleaned_content,
                            c.section, c.heading, c.selector, c.metadata_json,
                            d.canonical_url, d.title,
                            (c.embedding <=> $3) AS distance
                     FROM chunks c
                     JOIN documents d ON d.id = c.document_id
                     WHERE c.tenant_id = $1 AND c.site_id = $2
                       AND c.embedding IS NOT NULL
                       AND ($4::text IS NULL OR c.locale = $4)
                     ORDER BY c.embedding <=> $3
                     LIMIT $5",
                )
                .bind(query.scope.tenant_id.as_str())
                .bind(query.scope.site_id.as_str())
                .bind(embedding)
                .bind(&query.locale)
                .bind(query.k as i64)
                .fetch_all(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
                tx.commit().await.map_err(map_sqlx_err)?;

                rows.into_iter()
                    .map(|row| {
                        let distance: f64 = row.try_get("distance").map_err(map_sqlx_err)?;
                        ranked_chunk_from_row(&row, 1.0 - distance / 2.0)
                    })
                    .collect()
            }
        })
        .await
    }

    /// Full-text search over cleaned chunk content. The match predicate
    /// uses the `simple` configuration so it is served by the GIN index
    /// (one index cannot cover every per-row locale); ranking is
    /// language-aware via the locale's regconfig, normalized into [0, 1].
    #[instrument(skip(self, query), fields(scope = %query.scope, k = query.k))]
    pub async fn fts_search(&self, query: &FtsQuery) -> Result<Vec<RankedChunk>> {
        let query = query.clone();
        with_retry("fts_search", self.max_retries, move || {
            let query = query.clone();
            let pool = self.pool.clone();
            async move {
                let regconfig = regconfig_for_locale(query.locale.as_deref());
                let rows = sqlx::query(
                    "SELECT c.id, c.document_id, c.content, c.cleaned_content,
                            c.section, c.heading, c.selector, c.metadata_json,
                            d.canonical_url, d.title,
                            ts_rank_cd(to_tsvector($3::regconfig, c.cleaned_content),
                                       plainto_tsquery($3::regconfig, $4)) AS rank
                     FROM chunks c
                     JOIN documents d ON d.id = c.document_id
                     WHERE c.tenant_id = $1 AND c.site_id = $2
                       AND to_tsvector('simple', c.cleaned_content)
                           @@ plainto_tsquery('simple', $4)
                     ORDER BY rank DESC
                     LIMIT $5",
                )
                .bind(query.scope.tenant_id.as_str())
                .bind(query.scope.site_id.as_str())
                .bind(regconfig)
                .bind(&query.query)
                .bind(query.k as i64)
                .fetch_all(&pool)
                .await
                .map_err(map_sqlx_err)?;

                rows.into_iter()
                    .map(|row| {
                        let rank: f32 = row.try_get("rank").map_err(map_sqlx_err)?;
                        // ts_rank_cd is unbounded; squash into [0, 1).
                        let score = f64::from(rank);
                        ranked_chunk_from_row(&row, score / (1.0 + score))
                    })
                    .collect()
            }
        })
        .await
    }

    /// Chunks of documents carrying a structured entity whose type or
    /// labels match one of the query terms, ranked by entity confidence.
    #[instrument(skip(self, query), fields(scope = %query.scope))]
    pub async fn structured_search(&self, query: &StructuredQuery) -> Result<Vec<RankedChunk>> {
        if query.terms.is_empty() {
            return Ok(Vec::new());
        }
        let terms: Vec<String> = query.terms.iter().map(|t| t.to_lowercase()).collect();
        let rows = sqlx::query(
            "SELECT DISTINCT ON (c.id)
                    c.id, c.document_id, c.content, c.cleaned_content,
                    c.section, c.heading, c.selector, c.metadata_json,
                    d.canonical_url, d.title,
                    e.confidence
             FROM structured_entities e
             JOIN documents d ON d.id = e.document_id
             JOIN chunks c ON c.document_id = e.document_id
             WHERE e.tenant_id = $1 AND e.site_id = $2
               AND (lower(e.entity_type) = ANY($3)
                    OR EXISTS (SELECT 1 FROM unnest(e.labels) AS l WHERE lower(l) = ANY($3))
                    OR EXISTS (SELECT 1 FROM unnest($3::text[]) AS t
                               WHERE length(t) > 3 AND e.properties_json::text ILIKE '%' || t || '%'))
             ORDER BY c.id, e.confidence DESC
             LIMIT $4",
        )
        .bind(query.scope.tenant_id.as_str())
        .bind(query.scope.site_id.as_str())
        .bind(&terms)
        .bind(query.k as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut ranked: Vec<RankedChunk> = rows
            .into_iter()
            .map(|row| {
                let confidence: f32 = row.try_get("confidence").map_err(map_sqlx_err)?;
                ranked_chunk_from_row(&row, f64::from(confidence))
            })
            .collect::<Result<_>>()?;
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(ranked)
    }

    /// Convenience fusion of ANN and FTS inside the store: reciprocal rank
    /// fusion with `alpha` weighting the ANN list.
    pub async fn hybrid_search(
        &self,
        ann: &AnnQuery,
        fts: &FtsQuery,
        alpha: f64,
    ) -> Result<Vec<RankedChunk>> {
        let (vector_hits, text_hits) =
            tokio::try_join!(self.ann_search(ann), self.fts_search(fts))?;

        const RRF_K: f64 = 60.0;
        let mut fused: HashMap<ChunkId, (f64, RankedChunk)> = HashMap::new();
        for (rank, hit) in vector_hits.into_iter().enumerate() {
            let contribution = alpha / (RRF_K + rank as f64 + 1.0);
            fused
                .entry(hit.chunk_id)
                .and_modify(|(s, _)| *s += contribution)
                .or_insert((contribution, hit));
        }
        for (rank, hit) in text_hits.into_iter().enumerate() {
            let contribution = (1.0 - alpha) / (RRF_K + rank as f64 + 1.0);
            fused
                .entry(hit.chunk_id)
                .and_modify(|(s, _)| *s += contribution)
                .or_insert((contribution, hit));
        }

        let mut merged: Vec<RankedChunk> = fused
            .into_values()
            .map(|(score, mut hit)| {
                hit.score = score;
                hit
            })
            .collect();
        merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        merged.truncate(ann.k.max(fts.k));
        Ok(merged)
    }

    // ── Index maintenance & stats ───────────────────────────────────────

    #[instrument(skip(self))]
    pub async fn reindex(&self, kind: ReindexKind, concurrent: bool) -> Result<()> {
        let concurrently = if concurrent { "CONCURRENTLY " } else { "" };
        let drop_hnsw = format!("DROP INDEX {concurrently}IF EXISTS idx_chunks_embedding_hnsw");
        let drop_ivf = format!("DROP INDEX {concurrently}IF EXISTS idx_chunks_embedding_ivf");
        sqlx::query(&drop_hnsw).execute(&self.pool).await.map_err(map_sqlx_err)?;
        sqlx::query(&drop_ivf).execute(&self.pool).await.map_err(map_sqlx_err)?;

        match kind {
            ReindexKind::Hnsw => {
                let stmt = format!(
                    "CREATE INDEX {concurrently}idx_chunks_embedding_hnsw
                     ON chunks USING hnsw (embedding vector_cosine_ops)"
                );
                sqlx::query(&stmt).execute(&self.pool).await.map_err(map_sqlx_err)?;
            }
            ReindexKind::IvfFlat => {
                let stmt = format!(
                    "CREATE INDEX {concurrently}idx_chunks_embedding_ivf
                     ON chunks USING ivfflat (embedding vector_cosine_ops) WITH (lists = 100)"
                );
                sqlx::query(&stmt).execute(&self.pool).await.map_err(map_sqlx_err)?;
            }
            ReindexKind::Exact => {
                info!("ANN indexes dropped; vector queries will run exact scans");
            }
        }
        Ok(())
    }

    pub async fn stats(&self, scope: &TenantScope) -> Result<StoreStats> {
        let row = sqlx::query(
            "SELECT
                (SELECT count(*) FROM documents WHERE tenant_id = $1 AND site_id = $2) AS documents,
                (SELECT count(*) FROM chunks WHERE tenant_id = $1 AND site_id = $2) AS chunks,
                (SELECT count(*) FROM structured_entities WHERE tenant_id = $1 AND site_id = $2) AS entities,
                (SELECT COALESCE(avg(token_count), 0)::float8 FROM chunks WHERE tenant_id = $1 AND site_id = $2) AS avg_tokens",
        )
        .bind(scope.tenant_id.as_str())
        .bind(scope.site_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let index_row = sqlx::query(
            "SELECT indexname FROM pg_indexes
             WHERE tablename = 'chunks' AND indexname LIKE 'idx_chunks_embedding%'
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        let index_kind = match index_row {
            Some(row) => {
                let name: String = row.try_get("indexname").map_err(map_sqlx_err)?;
                if name.ends_with("hnsw") { "hnsw".to_string() } else { "ivfflat".to_string() }
            }
            None => "exact".to_string(),
        };

        Ok(StoreStats {
            document_count: row.try_get("documents").map_err(map_sqlx_err)?,
            chunk_count: row.try_get("chunks").map_err(map_sqlx_err)?,
            entity_count: row.try_get("entities").map_err(map_sqlx_err)?,
            avg_chunk_tokens: row.try_get("avg_tokens").map_err(map_sqlx_err)?,
            index_kind,
        })
    }

    // ── Crawl sessions ──────────────────────────────────────────────────

    /// Insert a new session. The partial unique index rejects a second
    /// active session for the same site; the conflict surfaces as
    /// `SessionConflict` carrying the running session's id.
    #[instrument(skip(self, session), fields(scope = %session.tenant_id, site = %session.site_id))]
    pub async fn insert_session(&self, session: &CrawlSession) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO crawl_sessions
                (id, tenant_id, site_id, session_type, state, counters_json,
                 failure_reason, started_at, finished_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(session.id.0)
        .bind(session.tenant_id.as_str())
        .bind(session.site_id.as_str())
        .bind(session.session_type.as_str())
        .bind(session.state.as_str())
        .bind(serde_json::to_value(session.counters)?)
        .bind(&session.failure_reason)
        .bind(session.started_at)
        .bind(session.finished_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                let scope = TenantScope::new(session.tenant_id.clone(), session.site_id.clone())?;
                let active = self
                    .find_active_session(&scope)
                    .await?
                    .map(|s| s.id.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                Err(KbError::SessionConflict { active })
            }
            Err(e) => Err(map_sqlx_err(e)),
        }
    }

    pub async fn update_session(
        &self,
        session_id: SessionId,
        state: SessionState,
        counters: &SessionCounters,
        failure_reason: Option<&str>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE crawl_sessions
             SET state = $2, counters_json = $3, failure_reason = $4, finished_at = $5
             WHERE id = $1",
        )
        .bind(session_id.0)
        .bind(state.as_str())
        .bind(serde_json::to_value(*counters)?)
        .bind(failure_reason)
        .bind(finished_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    pub async fn get_session(
        &self,
        scope: &TenantScope,
        session_id: SessionId,
    ) -> Result<Option<CrawlSession>> {
        let row = sqlx::query(
            "SELECT id, tenant_id, site_id, session_type, state, counters_json,
                    failure_reason, started_at, finished_at
             FROM crawl_sessions
             WHERE id = $1 AND tenant_id = $2 AND site_id = $3",
        )
        .bind(session_id.0)
        .bind(scope.tenant_id.as_str())
        .bind(scope.site_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        row.map(session_from_row).transpose()
    }

    pub async fn find_active_session(&self, scope: &TenantScope) -> Result<Option<CrawlSession>> {
        let row = sqlx::query(
            "SELECT id, tenant_id, site_id, session_type, state, counters_json,
                    failure_reason, started_at, finished_at
             FROM crawl_sessions
             WHERE tenant_id = $1 AND site_id = $2
               AND state IN ('pending', 'discovering', 'fetching', 'processing')
             LIMIT 1",
        )
        .bind(scope.tenant_id.as_str())
        .bind(scope.site_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        row.map(session_from_row).transpose()
    }

    /// Most recent `done` session; the delta baseline.
    pub async fn find_last_done_session(&self, scope: &TenantScope) -> Result<Option<CrawlSession>> {
        let row = sqlx::query(
            "SELECT id, tenant_id, site_id, session_type, state, counters_json,
                    failure_reason, started_at, finished_at
             FROM crawl_sessions
             WHERE tenant_id = $1 AND site_id = $2 AND state = 'done'
             ORDER BY finished_at DESC NULLS LAST
             LIMIT 1",
        )
        .bind(scope.tenant_id.as_str())
        .bind(scope.site_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        row.map(session_from_row).transpose()
    }

    // ── Manifests ───────────────────────────────────────────────────────

    /// Store a manifest, bumping the per-site version. Returns the version
    /// actually persisted.
    pub async fn upsert_manifest(&self, scope: &TenantScope, manifest: &SiteManifest) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO site_manifests (tenant_id, site_id, version, generated_at, manifest_json)
             VALUES ($1, $2, 1, $3, $4)
             ON CONFLICT (tenant_id, site_id) DO UPDATE SET
                version = site_manifests.version + 1,
                generated_at = EXCLUDED.generated_at,
                manifest_json = EXCLUDED.manifest_json
             RETURNING version",
        )
        .bind(scope.tenant_id.as_str())
        .bind(scope.site_id.as_str())
        .bind(manifest.generated_at)
        .bind(serde_json::to_value(manifest)?)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        let version: i64 = row.try_get("version").map_err(map_sqlx_err)?;

        // Keep the embedded copy's version in step with the row version.
        sqlx::query(
            "UPDATE site_manifests
             SET manifest_json = jsonb_set(manifest_json, '{version}', to_jsonb(version))
             WHERE tenant_id = $1 AND site_id = $2",
        )
        .bind(scope.tenant_id.as_str())
        .bind(scope.site_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(version)
    }

    pub async fn get_manifest(&self, scope: &TenantScope) -> Result<Option<SiteManifest>> {
        let row = sqlx::query(
            "SELECT manifest_json FROM site_manifests WHERE tenant_id = $1 AND site_id = $2",
        )
        .bind(scope.tenant_id.as_str())
        .bind(scope.site_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        match row {
            Some(row) => {
                let value: serde_json::Value =
                    row.try_get("manifest_json").map_err(map_sqlx_err)?;
                Ok(Some(serde_json::from_value(value)?))
            }
            None => Ok(None),
        }
    }

    /// The per-site corpus version surfaced in search responses. 0 until
    /// the first crawl completes.
    pub async fn corpus_version(&self, scope: &TenantScope) -> Result<i64> {
        let row = sqlx::query(
            "SELECT version FROM site_manifests WHERE tenant_id = $1 AND site_id = $2",
        )
        .bind(scope.tenant_id.as_str())
        .bind(scope.site_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        match row {
            Some(row) => Ok(row.try_get("version").map_err(map_sqlx_err)?),
            None => Ok(0),
        }
    }
}

fn document_from_row(row: sqlx::postgres::PgRow) -> Result<Document> {
    Ok(Document {
        id: DocumentId(row.try_get("id").map_err(map_sqlx_err)?),
        tenant_id: sitekb_common::TenantId::new(
            row.try_get::<String, _>("tenant_id").map_err(map_sqlx_err)?,
        ),
        site_id: sitekb_common::SiteId::new(
            row.try_get::<String, _>("site_id").map_err(map_sqlx_err)?,
        ),
        canonical_url: row.try_get("canonical_url").map_err(map_sqlx_err)?,
        title: row.try_get("title").map_err(map_sqlx_err)?,
        lastmod: row.try_get("lastmod").map_err(map_sqlx_err)?,
        etag: row.try_get("etag").map_err(map_sqlx_err)?,
        last_modified_header: row.try_get("last_modified").map_err(map_sqlx_err)?,
        locale: row.try_get("locale").map_err(map_sqlx_err)?,
        content_hash: row.try_get("content_hash").map_err(map_sqlx_err)?,
        fetched_at: row.try_get("fetched_at").map_err(map_sqlx_err)?,
    })
}

fn session_from_row(row: sqlx::postgres::PgRow) -> Result<CrawlSession> {
    let session_type: String = row.try_get("session_type").map_err(map_sqlx_err)?;
    let state: String = row.try_get("state").map_err(map_sqlx_err)?;
    let counters: serde_json::Value = row.try_get("counters_json").map_err(map_sqlx_err)?;
    Ok(CrawlSession {
        id: SessionId(row.try_get("id").map_err(map_sqlx_err)?),
        tenant_id: sitekb_common::TenantId::new(
            row.try_get::<String, _>("tenant_id").map_err(map_sqlx_err)?,
        ),
        site_id: sitekb_common::SiteId::new(
            row.try_get::<String, _>("site_id").map_err(map_sqlx_err)?,
        ),
        session_type: if session_type == "full" {
            SessionType::Full
        } else {
            SessionType::Delta
        },
        state: SessionState::parse(&state)?,
        counters: serde_json::from_value(counters)?,
        started_at: row.try_get("started_at").map_err(map_sqlx_err)?,
        finished_at: row.try_get("finished_at").map_err(map_sqlx_err)?,
        failure_reason: row.try_get("failure_reason").map_err(map_sqlx_err)?,
    })
}

fn ranked_chunk_from_row(row: &sqlx::postgres::PgRow, score: f64) -> Result<RankedChunk> {
    let metadata: serde_json::Value = row.try_get("metadata_json").map_err(map_sqlx_err)?;
    Ok(RankedChunk {
        chunk_id: ChunkId(row.try_get("id").map_err(map_sqlx_err)?),
        document_id: DocumentId(row.try_get("document_id").map_err(map_sqlx_err)?),
        content: row.try_get("content").map_err(map_sqlx_err)?,
        cleaned_content: row.try_get("cleaned_content").map_err(map_sqlx_err)?,
        section: row.try_get("section").map_err(map_sqlx_err)?,
        heading: row.try_get("heading").map_err(map_sqlx_err)?,
        selector: row.try_get("selector").map_err(map_sqlx_err)?,
        metadata: serde_json::from_value(metadata).unwrap_or_default(),
        document_url: row.try_get("canonical_url").map_err(map_sqlx_err)?,
        document_title: row.try_get("title").map_err(map_sqlx_err)?,
        score: score.clamp(0.0, 1.0),
    })
}

/// Native vector column first; the JSON-encoded text column is a legacy
/// read-only fallback and is never written.
fn decode_embedding(row: &sqlx::postgres::PgRow) -> Result<Option<Vec<f32>>> {
    let native: Option<Vector> = row.try_get("embedding").map_err(map_sqlx_err)?;
    if let Some(vector) = native {
        return Ok(Some(vector.to_vec()));
    }
    let legacy: Option<String> = row.try_get("embedding_json").map_err(map_sqlx_err)?;
    match legacy {
        Some(text) => Ok(serde_json::from_str(&text).ok()),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locale_maps_to_regconfig() {
        assert_eq!(regconfig_for_locale(Some("en")), "english");
        assert_eq!(regconfig_for_locale(Some("en-US")), "english");
        assert_eq!(regconfig_for_locale(Some("de_DE")), "german");
        assert_eq!(regconfig_for_locale(Some("ja")), "simple");
        assert_eq!(regconfig_for_locale(None), "simple");
    }

    #[tokio::test]
    async fn retry_gives_up_on_permanent_errors() {
        let mut calls = 0u32;
        let result: Result<()> = with_retry("op", 3, || {
            calls += 1;
            async move { Err(KbError::Backend("boom".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retry_retries_transient_then_succeeds() {
        let mut calls = 0u32;
        let result = with_retry("op", 5, || {
            calls += 1;
            let fail = calls < 3;
            async move {
                if fail {
                    Err(KbError::Transient("flaky".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls, 3);
    }
}
