use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use sitekb_budget::BudgetController;
use sitekb_common::{
    embedding::{estimate_tokens, EmbeddingProvider},
    ActionDescriptor, BudgetDimension, ChunkId, KbError, Result, RetrievalConfig, SiteManifest,
    TenantId, TenantScope,
};
use sitekb_storage::{AnnQuery, FtsQuery, IndexHint, PostgresStore, RankedChunk, StructuredQuery};

use crate::cache::{query_fingerprint, CacheLookup, SearchFilters, TieredCache};
use crate::rrf::{fuse, FusionOptions, RankedItem, RankedList, SystemContribution};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStrategy {
    Vector,
    Fulltext,
    Structured,
}

impl SearchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchStrategy::Vector => "vector",
            SearchStrategy::Fulltext => "fulltext",
            SearchStrategy::Structured => "structured",
        }
    }

    pub const DEFAULT: [SearchStrategy; 3] = [
        SearchStrategy::Vector,
        SearchStrategy::Fulltext,
        SearchStrategy::Structured,
    ];
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub scope: TenantScope,
    pub query: String,
    pub top_k: Option<usize>,
    pub strategies: Vec<SearchStrategy>,
    pub filters: SearchFilters,
    /// Overrides the configured fusion weights, keyed by strategy.
    pub fusion_weights: Option<HashMap<SearchStrategy, f64>>,
}

impl SearchRequest {
    pub fn new(scope: TenantScope, query: impl Into<String>) -> Self {
        Self {
            scope,
            query: query.into(),
            top_k: None,
            strategies: SearchStrategy::DEFAULT.to_vec(),
            filters: SearchFilters::default(),
            fusion_weights: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: ChunkId,
    pub content: String,
    pub url: String,
    pub title: Option<String>,
    pub section: Option<String>,
    pub heading: Option<String>,
    pub score: f64,
    pub metadata: HashMap<String, serde_json::Value>,
    /// Executable actions associated with this chunk's page or selector.
    pub actions: Vec<ActionDescriptor>,
    /// Per-strategy scores and ranks behind the fused score.
    pub breakdown: Vec<SystemContribution>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    /// Corpus version the results were computed against; bumps on crawl
    /// completion.
    pub session_version: i64,
    pub served_from_cache: bool,
    /// True when the cached entry was past TTL (stale-while-revalidate).
    pub served_stale: bool,
    /// True when at least one strategy missed the deadline and fusion ran
    /// on the remainder.
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Hybrid search: budget gate, tiered cache, parallel vector + fulltext +
/// structured retrieval, RRF fusion, enrichment. Cheap to clone; all state
/// is shared.
#[derive(Clone)]
pub struct HybridSearchEngine {
    store: Arc<PostgresStore>,
    cache: Arc<TieredCache<SearchResponse>>,
    embedder: Arc<dyn EmbeddingProvider>,
    budget: Arc<BudgetController>,
    config: RetrievalConfig,
}

impl HybridSearchEngine {
    pub fn new(
        store: Arc<PostgresStore>,
        cache: TieredCache<SearchResponse>,
        embedder: Arc<dyn EmbeddingProvider>,
        budget: Arc<BudgetController>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            cache: Arc::new(cache),
            embedder,
            budget,
            config,
        }
    }

    pub async fn invalidate_scope(&self, scope: &TenantScope) -> Result<()> {
        self.cache.invalidate(scope).await
    }

    /// Drop cached results for every site of a tenant.
    pub async fn invalidate_tenant(&self, tenant_id: &TenantId) -> Result<()> {
        self.cache
            .invalidate_tenant(&format!("{}:", tenant_id.as_str()))
            .await
    }

    #[instrument(skip(self, request, cancel), fields(scope = %request.scope, query = %request.query))]
    pub async fn search(
        &self,
        request: SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<SearchResponse> {
        if request.query.trim().is_empty() {
            return Err(KbError::InvalidInput("empty query".to_string()));
        }

        // Budget gate first: a denied check with no overage never reaches
        // the corpus and never mutates usage. Both the call itself and the
        // query's embedding cost are gated.
        let token_cost = f64::from(estimate_tokens(&request.query));
        for (dimension, amount) in [
            (BudgetDimension::ApiCalls, 1.0),
            (BudgetDimension::Tokens, token_cost),
        ] {
            let check = self.budget.check(&request.scope, dimension, amount).await?;
            if !check.allowed && !check.overage_allowed {
                return Err(KbError::BudgetExceeded {
                    dimension: dimension.to_string(),
                    requested: amount,
                    remaining: check.remaining,
                });
            }
        }

        let top_k = request.top_k.unwrap_or(self.config.default_top_k);
        let strategy_names: Vec<String> = request
            .strategies
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let key = query_fingerprint(
            &request.scope,
            &request.query,
            &request.filters,
            &strategy_names,
            top_k,
        );

        match self.cache.get(&key).await {
            CacheLookup::Fresh(mut cached) => {
                debug!("cache hit");
                cached.served_from_cache = true;
                cached.served_stale = false;
                return Ok(cached);
            }
            CacheLookup::Stale(mut cached) => {
                debug!("stale hit, scheduling revalidation");
                let engine = self.clone();
                let request = request.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine.refresh(request, key).await {
                        warn!(error = %e, "background revalidation failed");
                    }
                });
                cached.served_from_cache = true;
                cached.served_stale = true;
                return Ok(cached);
            }
            CacheLookup::Miss => {}
        }

        if cancel.is_cancelled() {
            return Err(KbError::Cancelled);
        }

        let mut response = self.execute(&request, top_k, cancel).await?;

        // Usage accounting happens only on the computed path.
        let record = self
            .budget
            .record(&request.scope, BudgetDimension::ApiCalls, 1.0)
            .await?;
        let token_record = self
            .budget
            .record(&request.scope, BudgetDimension::Tokens, token_cost)
            .await?;
        response.warning = record.warning.or(token_record.warning);

        self.cache.set(&key, response.clone(), &request.scope).await?;
        Ok(response)
    }

    /// Background SWR refresh: recompute and overwrite the cache entry.
    async fn refresh(&self, request: SearchRequest, key: String) -> Result<()> {
        let top_k = request.top_k.unwrap_or(self.config.default_top_k);
        let cancel = CancellationToken::new();
        let response = self.execute(&request, top_k, &cancel).await?;
        self.cache.set(&key, response, &request.scope).await
    }

    async fn execute(
        &self,
        request: &SearchRequest,
        top_k: usize,
        cancel: &CancellationToken,
    ) -> Result<SearchResponse> {
        let deadline = Duration::from_millis(self.config.search_timeout_ms);
        let k = self.config.candidate_k.max(top_k);

        // The query embedding is only needed for the vector strategy; a
        // provider failure or timeout degrades to the other strategies.
        let wants_vector = request.strategies.contains(&SearchStrategy::Vector);
        let embedding = if wants_vector {
            match tokio::time::timeout(deadline, self.embedder.embed(&request.query)).await {
                Ok(Ok(embedding)) => Some(embedding),
                Ok(Err(e)) => {
                    warn!(error = %e, "query embedding failed, degrading");
                    None
                }
                Err(_) => {
                    warn!("query embedding timed out, degrading");
                    None
                }
            }
        } else {
            None
        };

        if cancel.is_cancelled() {
            return Err(KbError::Cancelled);
        }

        let mut lists: Vec<RankedList> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();
        let mut by_id: HashMap<String, RankedChunk> = HashMap::new();
        let mut degraded = false;

        let vector_future = async {
            let embedding = embedding.clone()?;
            let query = AnnQuery {
                scope: request.scope.clone(),
                locale: request.filters.locale.clone(),
                embedding,
                k,
                index_hint: IndexHint::default(),
            };
            Some(tokio::time::timeout(deadline, self.store.ann_search(&query)).await)
        };
        let fts_future = async {
            if !request.strategies.contains(&SearchStrategy::Fulltext) {
                return None;
            }
            let query = FtsQuery {
                scope: request.scope.clone(),
                query: request.query.clone(),
                k,
                locale: request.filters.locale.clone(),
            };
            Some(tokio::time::timeout(deadline, self.store.fts_search(&query)).await)
        };
        let structured_future = async {
            if !request.strategies.contains(&SearchStrategy::Structured) {
                return None;
            }
            let query = StructuredQuery {
                scope: request.scope.clone(),
                terms: structured_terms(&request.query),
                k,
            };
            Some(tokio::time::timeout(deadline, self.store.structured_search(&query)).await)
        };

        let (vector_result, fts_result, structured_result) = tokio::select! {
            results = futures::future::join3(vector_future, fts_future, structured_future) => results,
            _ = cancel.cancelled() => return Err(KbError::Cancelled),
        };

        let mut collect = |name: &str,
                           weight: f64,
                           result: Option<std::result::Result<Result<Vec<RankedChunk>>, tokio::time::error::Elapsed>>,
                           requested: bool| {
            match result {
                Some(Ok(Ok(chunks))) => {
                    let items = chunks
                        .iter()
                        .map(|c| RankedItem {
                            id: c.chunk_id.to_string(),
                            score: c.score,
                        })
                        .collect();
                    for chunk in chunks {
                        by_id.entry(chunk.chunk_id.to_string()).or_insert(chunk);
                    }
                    lists.push(RankedList {
                        system: name.to_string(),
                        items,
                    });
                    weights.push(weight);
                }
                Some(Ok(Err(e))) => {
                    warn!(strategy = name, error = %e, "strategy failed, partial fusion");
                    degraded = true;
                }
                Some(Err(_)) => {
                    warn!(strategy = name, "strategy missed the deadline, partial fusion");
                    degraded = true;
                }
                None => {
                    if requested {
                        // Requested but unavailable (e.g. embedding failed).
                        degraded = true;
                    }
                }
            }
        };

        let (vector_weight, fulltext_weight, structured_weight) = self.weights_for(request);
        collect("vector", vector_weight, vector_result, wants_vector);
        collect(
            "fulltext",
            fulltext_weight,
            fts_result,
            request.strategies.contains(&SearchStrategy::Fulltext),
        );
        collect(
            "structured",
            structured_weight,
            structured_result,
            request.strategies.contains(&SearchStrategy::Structured),
        );

        if lists.is_empty() {
            return Err(KbError::Timeout("all search strategies".to_string()));
        }

        let fused = fuse(
            &lists,
            &FusionOptions {
                k: self.config.rrf_k,
                weights,
                max_results: Some(top_k),
                ..FusionOptions::default()
            },
        );

        let manifest = self.store.get_manifest(&request.scope).await?;
        let results: Vec<SearchHit> = fused
            .into_iter()
            .filter_map(|item| {
                by_id.remove(&item.id).map(|chunk| SearchHit {
                    actions: related_actions(manifest.as_ref(), &chunk),
                    chunk_id: chunk.chunk_id,
                    content: chunk.content,
                    url: chunk.document_url,
                    title: chunk.document_title,
                    section: chunk.section,
                    heading: chunk.heading,
                    score: item.score,
                    metadata: chunk.metadata,
                    breakdown: item.per_system,
                })
            })
            .collect();

        let session_version = self.store.corpus_version(&request.scope).await?;
        info!(
            results = results.len(),
            degraded, session_version, "search executed"
        );

        Ok(SearchResponse {
            results,
            session_version,
            served_from_cache: false,
            served_stale: false,
            degraded,
            warning: None,
        })
    }

    fn weights_for(&self, request: &SearchRequest) -> (f64, f64, f64) {
        match &request.fusion_weights {
            Some(weights) => (
                weights
                    .get(&SearchStrategy::Vector)
                    .copied()
                    .unwrap_or(self.config.vector_weight),
                weights
                    .get(&SearchStrategy::Fulltext)
                    .copied()
                    .unwrap_or(self.config.fulltext_weight),
                weights
                    .get(&SearchStrategy::Structured)
                    .copied()
                    .unwrap_or(self.config.structured_weight),
            ),
            None => (
                self.config.vector_weight,
                self.config.fulltext_weight,
                self.config.structured_weight,
            ),
        }
    }
}

/// Terms for the structured strategy: the whole query plus its non-trivial
/// words.
fn structured_terms(query: &str) -> Vec<String> {
    let mut terms = vec![query.trim().to_lowercase()];
    for word in query.split_whitespace() {
        let word = word.to_lowercase();
        if word.len() > 2 && !terms.contains(&word) {
            terms.push(word);
        }
    }
    terms
}

/// Actions from the site manifest associated with a chunk, matched by
/// source page URL or selector.
fn related_actions(manifest: Option<&SiteManifest>, chunk: &RankedChunk) -> Vec<ActionDescriptor> {
    let Some(manifest) = manifest else {
        return Vec::new();
    };
    manifest
        .actions
        .iter()
        .filter(|action| {
            let url_match = action
                .source_url
                .as_deref()
                .map(|u| u == chunk.document_url)
                .unwrap_or(false);
            let selector_match = chunk
                .selector
                .as_deref()
                .map(|s| s == action.selector)
                .unwrap_or(false);
            url_match || selector_match
        })
        .take(5)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_terms_include_query_and_words() {
        let terms = structured_terms("Refund Policy FAQ");
        assert_eq!(terms[0], "refund policy faq");
        assert!(terms.contains(&"refund".to_string()));
        assert!(terms.contains(&"faq".to_string()));
        assert!(!terms.contains(&"fa".to_string()));
    }

    #[test]
    fn default_strategies_cover_all_three() {
        let scope = TenantScope::new(
            sitekb_common::TenantId::new("t"),
            sitekb_common::SiteId::new("s"),
        )
        .unwrap();
        let request = SearchRequest::new(scope, "q");
        assert_eq!(request.strategies.len(), 3);
    }
}
