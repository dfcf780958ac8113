use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use sitekb_common::{
    embedding::EmbeddingProvider, Chunk, ChunkId, CrawlSession, CrawlerConfig, Document,
    DocumentId, KbError, Result, SessionCounters, SessionId, SessionState, SessionType,
    SiteManifest, StructuredEntity, SystemConfig, TenantScope,
};
use sitekb_extract::{
    chunk_content, ActionDraft, ChunkerOptions, ContentOptions, ExtractedForm, ExtractorPipeline,
    ManifestGenerator,
};
use sitekb_storage::{DocumentValidators, PostgresStore};

use crate::fetcher::{ConditionalFetcher, FetchOutcome, FetchedPage};
use crate::sitemap::{find_changed_urls, SitemapReader};

/// Invoked after a session reaches `done`; the search layer hooks its
/// scoped cache invalidation here.
pub type CompletionHook = Arc<dyn Fn(TenantScope) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
struct ActiveSession {
    id: SessionId,
    cancel: CancellationToken,
}

/// Strip fragments and tracking parameters so one page has one key.
pub fn normalize_url(raw: &str) -> Result<String> {
    let mut url =
        Url::parse(raw).map_err(|e| KbError::InvalidInput(format!("bad url {raw}: {e}")))?;
    url.set_fragment(None);

    let tracking = ["utm_source", "utm_medium", "utm_campaign", "utm_content", "utm_term"];
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !tracking.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        let query = kept
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        url.set_query(Some(&query));
    }
    Ok(url.to_string())
}

enum FetchClass {
    Unchanged,
    Failed,
    Page(FetchedPage),
}

/// Drives a `CrawlSession` through
/// `pending → discovering → fetching → processing → done | failed`
/// while keeping the corpus freshness-synchronized. The handle is cheap to
/// clone; all state is shared.
#[derive(Clone)]
pub struct CrawlOrchestrator {
    store: Arc<PostgresStore>,
    fetcher: Arc<ConditionalFetcher>,
    sitemaps: Arc<SitemapReader>,
    embedder: Arc<dyn EmbeddingProvider>,
    crawler_config: CrawlerConfig,
    chunker_options: ChunkerOptions,
    pipeline: ExtractorPipeline,
    active: Arc<DashMap<String, ActiveSession>>,
    url_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    completion_hook: Arc<Mutex<Option<CompletionHook>>>,
}

impl CrawlOrchestrator {
    pub fn new(
        config: &SystemConfig,
        store: Arc<PostgresStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let fetcher = Arc::new(ConditionalFetcher::new(&config.crawler)?);
        let sitemaps = Arc::new(SitemapReader::new(
            fetcher.http_client(),
            std::time::Duration::from_secs(config.crawler.sitemap_cache_ttl_secs),
        ));
        Ok(Self {
            store,
            fetcher,
            sitemaps,
            embedder,
            crawler_config: config.crawler.clone(),
            chunker_options: ChunkerOptions {
                max_tokens: config.chunking.max_tokens,
                overlap_tokens: config.chunking.overlap_tokens,
            },
            pipeline: ExtractorPipeline::new(ContentOptions {
                min_paragraph_chars: config.chunking.min_paragraph_chars,
                ..ContentOptions::default()
            }),
            active: Arc::new(DashMap::new()),
            url_locks: Arc::new(DashMap::new()),
            completion_hook: Arc::new(Mutex::new(None)),
        })
    }

    pub async fn set_completion_hook(&self, hook: CompletionHook) {
        *self.completion_hook.lock().await = Some(hook);
    }

    /// Begin a crawl. Rejects a second active session for the same site
    /// with the running session's id.
    #[instrument(skip(self), fields(scope = %scope, session_type = ?session_type))]
    pub async fn start_session(
        &self,
        scope: TenantScope,
        base_url: String,
        session_type: SessionType,
    ) -> Result<SessionId> {
        if let Some(existing) = self.active.get(&scope.tag()) {
            return Err(KbError::SessionConflict {
                active: existing.id.to_string(),
            });
        }

        let session = CrawlSession {
            id: SessionId::new(),
            tenant_id: scope.tenant_id.clone(),
            site_id: scope.site_id.clone(),
            session_type,
            state: SessionState::Pending,
            counters: SessionCounters::default(),
            started_at: Utc::now(),
            finished_at: None,
            failure_reason: None,
        };
        // The partial unique index is the arbiter under races.
        self.store.insert_session(&session).await?;

        let cancel = CancellationToken::new();
        self.active.insert(
            scope.tag(),
            ActiveSession {
                id: session.id,
                cancel: cancel.clone(),
            },
        );

        let orchestrator = self.clone();
        let session_id = session.id;
        tokio::spawn(async move {
            orchestrator
                .run_session(session, scope, base_url, cancel)
                .await;
        });
        info!(session = %session_id, "crawl session started");
        Ok(session_id)
    }

    /// Cancel the active session for a site, if any. Already-committed
    /// writes are kept.
    pub fn cancel_session(&self, scope: &TenantScope) -> Option<SessionId> {
        self.active.get(&scope.tag()).map(|session| {
            session.cancel.cancel();
            session.id
        })
    }

    pub async fn session_status(
        &self,
        scope: &TenantScope,
        session_id: SessionId,
    ) -> Result<Option<CrawlSession>> {
        self.store.get_session(scope, session_id).await
    }

    async fn run_session(
        &self,
        session: CrawlSession,
        scope: TenantScope,
        base_url: String,
        cancel: CancellationToken,
    ) {
        let session_id = session.id;
        let counters = Arc::new(Mutex::new(SessionCounters::default()));
        let result = self
            .drive(&session, &scope, &base_url, &cancel, &counters)
            .await;
        // Whatever happened, the counters accumulated so far are persisted
        // with the terminal state.
        let counters = *counters.lock().await;

        let outcome = match result {
            Ok(()) => {
                self.store
                    .update_session(session_id, SessionState::Done, &counters, None, Some(Utc::now()))
                    .await
            }
            Err(KbError::Cancelled) => {
                warn!(session = %session_id, "session cancelled");
                self.store
                    .update_session(
                        session_id,
                        SessionState::Failed,
                        &counters,
                        Some("cancelled"),
                        Some(Utc::now()),
                    )
                    .await
            }
            Err(e) => {
                error!(session = %session_id, error = %e, code = e.code(), "session failed");
                self.store
                    .update_session(
                        session_id,
                        SessionState::Failed,
                        &counters,
                        Some(&e.to_string()),
                        Some(Utc::now()),
                    )
                    .await
            }
        };
        if let Err(e) = outcome {
            error!(session = %session_id, error = %e, "failed to persist terminal session state");
        }

        self.active.remove(&scope.tag());

        let hook = self.completion_hook.lock().await.clone();
        if let Some(hook) = hook {
            hook(scope.clone()).await;
        }
    }

    async fn drive(
        &self,
        session: &CrawlSession,
        scope: &TenantScope,
        base_url: &str,
        cancel: &CancellationToken,
        shared_counters: &Arc<Mutex<SessionCounters>>,
    ) -> Result<()> {
        // ── discovering ────────────────────────────────────────────────
        self.transition(session, SessionState::Discovering, shared_counters).await?;
        let robots_sitemaps = self.fetcher.robots_sitemaps(base_url).await.unwrap_or_default();
        let entries = self.sitemaps.discover(base_url, &robots_sitemaps).await?;
        shared_counters.lock().await.urls_discovered = entries.len() as u64;

        let candidates = match session.session_type {
            SessionType::Full => entries,
            SessionType::Delta => {
                let baseline = self
                    .store
                    .find_last_done_session(scope)
                    .await?
                    .and_then(|s| s.finished_at);
                find_changed_urls(&entries, baseline)
            }
        };

        if cancel.is_cancelled() {
            return Err(KbError::Cancelled);
        }

        // ── fetching ───────────────────────────────────────────────────
        self.transition(session, SessionState::Fetching, shared_counters).await?;
        let validators = self.store.get_document_validators(scope).await?;

        let permits = Arc::new(Semaphore::new(self.crawler_config.max_concurrent_fetches.max(1)));
        let mut fetches: FuturesUnordered<_> = candidates
            .iter()
            .filter_map(|entry| normalize_url(&entry.url).ok().map(|url| (url, entry.lastmod)))
            .map(|(url, lastmod)| {
                let permits = permits.clone();
                let cancel = cancel.clone();
                let validator = validators.get(&url).cloned();
                async move {
                    let _permit = match permits.acquire().await {
                        Ok(permit) => permit,
                        Err(_) => return (url, lastmod, Err(KbError::Cancelled)),
                    };
                    let outcome = self.fetch_one(&url, validator.as_ref(), &cancel).await;
                    (url, lastmod, outcome)
                }
            })
            .collect();

        let mut pages = Vec::new();
        while let Some((url, lastmod, outcome)) = fetches.next().await {
            let mut counters = shared_counters.lock().await;
            match outcome {
                Ok(FetchClass::Unchanged) => {
                    counters.urls_fetched += 1;
                    counters.urls_unchanged += 1;
                }
                Ok(FetchClass::Failed) => {
                    counters.urls_fetched += 1;
                    counters.urls_failed += 1;
                }
                Ok(FetchClass::Page(page)) => {
                    counters.urls_fetched += 1;
                    counters.urls_changed += 1;
                    pages.push((url, lastmod, page));
                }
                Err(KbError::Cancelled) => return Err(KbError::Cancelled),
                Err(e) => {
                    warn!(url, error = %e, "fetch failed");
                    counters.urls_fetched += 1;
                    counters.urls_failed += 1;
                }
            }
        }
        drop(fetches);

        if cancel.is_cancelled() {
            return Err(KbError::Cancelled);
        }

        // ── processing ─────────────────────────────────────────────────
        self.transition(session, SessionState::Processing, shared_counters).await?;
        let drafts: Arc<Mutex<(Vec<ActionDraft>, Vec<ExtractedForm>)>> =
            Arc::new(Mutex::new((Vec::new(), Vec::new())));
        let mut processed_urls = HashSet::new();

        let workers = Arc::new(Semaphore::new(self.crawler_config.worker_count.max(1)));
        let mut jobs: FuturesUnordered<_> = pages
            .into_iter()
            .map(|(url, lastmod, page)| {
                let workers = workers.clone();
                let cancel = cancel.clone();
                let shared_counters = shared_counters.clone();
                let drafts = drafts.clone();
                let scope = scope.clone();
                async move {
                    let _permit = match workers.acquire().await {
                        Ok(permit) => permit,
                        Err(_) => return (url, Err(KbError::Cancelled)),
                    };
                    if cancel.is_cancelled() {
                        return (url, Err(KbError::Cancelled));
                    }
                    let result = self
                        .process_document(&scope, &url, lastmod, page, &cancel, &shared_counters, &drafts)
                        .await;
                    (url, result)
                }
            })
            .collect();

        while let Some((url, result)) = jobs.next().await {
            match result {
                Ok(()) => {
                    processed_urls.insert(url);
                }
                Err(KbError::Cancelled) => return Err(KbError::Cancelled),
                Err(e) => {
                    warn!(url, error = %e, code = e.code(), "document processing failed");
                    shared_counters.lock().await.urls_failed += 1;
                }
            }
        }
        drop(jobs);

        if cancel.is_cancelled() {
            return Err(KbError::Cancelled);
        }

        // Manifest regeneration is the last step; it observes exactly the
        // documents committed above.
        let (action_drafts, forms) = {
            let guard = drafts.lock().await;
            (guard.0.clone(), guard.1.clone())
        };
        let generator = ManifestGenerator::new(base_url, vec![origin_of(base_url)]);
        let fresh = generator.generate(&scope.site_id, &action_drafts, &forms, Utc::now());
        let previous = self.store.get_manifest(scope).await?;
        let merged = merge_manifest(previous, fresh, &processed_urls);
        let version = self.store.upsert_manifest(scope, &merged).await?;
        let chunks_upserted = shared_counters.lock().await.chunks_upserted;
        info!(scope = %scope, version, chunks = chunks_upserted, "manifest regenerated");

        Ok(())
    }

    async fn transition(
        &self,
        session: &CrawlSession,
        state: SessionState,
        counters: &Arc<Mutex<SessionCounters>>,
    ) -> Result<()> {
        let snapshot = *counters.lock().await;
        self.store
            .update_session(session.id, state, &snapshot, None, None)
            .await
    }

    async fn fetch_one(
        &self,
        url: &str,
        validator: Option<&DocumentValidators>,
        cancel: &CancellationToken,
    ) -> Result<FetchClass> {
        match self.fetcher.fetch(url, validator, cancel).await {
            Ok(FetchOutcome::NotModified) => Ok(FetchClass::Unchanged),
            Ok(FetchOutcome::Disallowed) => Ok(FetchClass::Failed),
            Ok(FetchOutcome::Fetched(page)) => {
                // A 200 with an unchanged body hash is still unchanged.
                if let Some(v) = validator {
                    if v.content_hash == page.content_hash {
                        return Ok(FetchClass::Unchanged);
                    }
                }
                Ok(FetchClass::Page(page))
            }
            Err(KbError::Cancelled) => Err(KbError::Cancelled),
            Err(KbError::Fetch { url, status }) => {
                warn!(url, status, "terminal fetch failure");
                Ok(FetchClass::Failed)
            }
            Err(e) => {
                warn!(url, error = %e, "fetch gave up");
                Ok(FetchClass::Failed)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(url))]
    async fn process_document(
        &self,
        scope: &TenantScope,
        url: &str,
        lastmod: Option<chrono::DateTime<Utc>>,
        page: FetchedPage,
        cancel: &CancellationToken,
        counters: &Arc<Mutex<SessionCounters>>,
        drafts: &Arc<Mutex<(Vec<ActionDraft>, Vec<ExtractedForm>)>>,
    ) -> Result<()> {
        // Writes to one document are serialized; other documents proceed in
        // parallel.
        let lock = self
            .url_locks
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let extraction = self.pipeline.run(&page.body, url);
        let chunk_drafts = chunk_content(&extraction.content, &self.chunker_options);

        if cancel.is_cancelled() {
            return Err(KbError::Cancelled);
        }

        // Delta embedding: reuse stored vectors for unchanged hashes, call
        // the provider only for genuinely new content.
        let hashes: Vec<String> = chunk_drafts.iter().map(|c| c.content_hash.clone()).collect();
        let mut known = self.store.get_embeddings_by_hashes(scope, &hashes).await?;
        let mut to_embed: Vec<(String, String)> = Vec::new();
        let mut queued = HashSet::new();
        for draft in &chunk_drafts {
            if !known.contains_key(&draft.content_hash) && queued.insert(draft.content_hash.clone()) {
                to_embed.push((draft.content_hash.clone(), draft.cleaned_content.clone()));
            }
        }
        if !to_embed.is_empty() {
            if cancel.is_cancelled() {
                return Err(KbError::Cancelled);
            }
            let texts: Vec<String> = to_embed.iter().map(|(_, text)| text.clone()).collect();
            let vectors = self.embedder.embed_batch(&texts).await?;
            counters.lock().await.embeddings_generated += vectors.len() as u64;
            for ((hash, _), vector) in to_embed.into_iter().zip(vectors) {
                known.insert(hash, vector);
            }
        }

        let document_id = DocumentId::new();
        let locale = extraction.content.language.clone();
        let chunks: Vec<Chunk> = chunk_drafts
            .into_iter()
            .map(|draft| Chunk {
                id: ChunkId::new(),
                tenant_id: scope.tenant_id.clone(),
                site_id: scope.site_id.clone(),
                document_id,
                chunk_index: draft.chunk_index,
                embedding: known.get(&draft.content_hash).cloned(),
                content: draft.content,
                cleaned_content: draft.cleaned_content,
                content_hash: draft.content_hash,
                token_count: draft.token_count,
                locale: locale.clone(),
                section: draft.section,
                heading: draft.heading,
                selector: draft.selector,
                metadata: HashMap::new(),
            })
            .collect();

        let entities: Vec<StructuredEntity> = extraction
            .jsonld
            .entities
            .iter()
            .map(|draft| StructuredEntity {
                id: Uuid::new_v4(),
                tenant_id: scope.tenant_id.clone(),
                site_id: scope.site_id.clone(),
                document_id,
                entity_type: draft.entity_type.clone(),
                properties: draft.properties.clone(),
                confidence: draft.confidence,
                labels: draft.labels.clone(),
            })
            .collect();

        let document = Document {
            id: document_id,
            tenant_id: scope.tenant_id.clone(),
            site_id: scope.site_id.clone(),
            canonical_url: url.to_string(),
            title: extraction.content.title.clone(),
            lastmod,
            etag: page.etag.clone(),
            last_modified_header: page.last_modified.clone(),
            locale,
            content_hash: page.content_hash.clone(),
            fetched_at: Utc::now(),
        };

        if cancel.is_cancelled() {
            return Err(KbError::Cancelled);
        }
        let (inserted, skipped) = self
            .store
            .replace_document_content(&document, &chunks, &entities)
            .await?;

        {
            let mut counters = counters.lock().await;
            counters.chunks_upserted += inserted;
            counters.chunks_skipped += skipped;
        }
        {
            let mut guard = drafts.lock().await;
            guard.0.extend(extraction.actions.actions);
            guard.1.extend(extraction.forms.forms);
        }
        Ok(())
    }
}

fn origin_of(base_url: &str) -> String {
    Url::parse(base_url)
        .map(|u| u.origin().ascii_serialization())
        .unwrap_or_else(|_| base_url.to_string())
}

/// Delta sessions only re-extract changed pages; actions discovered on
/// untouched pages are carried over from the previous manifest.
fn merge_manifest(
    previous: Option<SiteManifest>,
    mut fresh: SiteManifest,
    processed_urls: &HashSet<String>,
) -> SiteManifest {
    let Some(previous) = previous else {
        return fresh;
    };

    let fresh_keys: HashSet<(String, String)> = fresh
        .actions
        .iter()
        .map(|a| (a.selector.to_lowercase(), a.kind.as_str().to_string()))
        .collect();

    for action in previous.actions {
        let untouched = action
            .source_url
            .as_ref()
            .map(|u| !processed_urls.contains(u))
            .unwrap_or(false);
        let key = (action.selector.to_lowercase(), action.kind.as_str().to_string());
        if untouched && !fresh_keys.contains(&key) {
            fresh.actions.push(action);
        }
    }

    for capability in previous.capabilities {
        if !fresh.capabilities.contains(&capability) {
            fresh.capabilities.push(capability);
        }
    }
    for selector in previous.privacy_settings.sensitive_selectors {
        if !fresh.privacy_settings.sensitive_selectors.contains(&selector) {
            fresh.privacy_settings.sensitive_selectors.push(selector);
        }
    }
    fresh
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitekb_common::{ActionDescriptor, ActionKind, Capability, RiskLevel, SideEffect, SiteId};

    fn descriptor(selector: &str, source_url: &str) -> ActionDescriptor {
        ActionDescriptor {
            id: selector.to_string(),
            name: selector.trim_start_matches('#').to_string(),
            kind: ActionKind::Button,
            description: String::new(),
            selector: selector.to_string(),
            parameters: Vec::new(),
            side_effecting: SideEffect::Read,
            risk_level: RiskLevel::Low,
            requires_confirmation: false,
            requires_auth: false,
            json_schema: serde_json::json!({}),
            category: None,
            source_url: Some(source_url.to_string()),
        }
    }

    fn manifest(actions: Vec<ActionDescriptor>, capabilities: Vec<Capability>) -> SiteManifest {
        SiteManifest {
            schema_version: "1.0".to_string(),
            site_id: SiteId::new("s"),
            version: 0,
            generated_at: Utc::now(),
            actions,
            capabilities,
            security_settings: Default::default(),
            privacy_settings: Default::default(),
        }
    }

    #[test]
    fn url_normalization_strips_fragments_and_tracking() {
        let url = normalize_url("https://acme.test/page?utm_source=x&id=5#section").unwrap();
        assert_eq!(url, "https://acme.test/page?id=5");
        let url = normalize_url("https://acme.test/page?utm_source=x#top").unwrap();
        assert_eq!(url, "https://acme.test/page");
        assert!(normalize_url("not a url").is_err());
    }

    #[test]
    fn merge_keeps_actions_from_untouched_pages() {
        let previous = manifest(
            vec![
                descriptor("#keep", "https://acme.test/untouched"),
                descriptor("#stale", "https://acme.test/reprocessed"),
            ],
            vec![Capability::HasBooking],
        );
        let fresh = manifest(
            vec![descriptor("#new", "https://acme.test/reprocessed")],
            vec![Capability::Navigation],
        );
        let processed: HashSet<String> = ["https://acme.test/reprocessed".to_string()].into();

        let merged = merge_manifest(Some(previous), fresh, &processed);
        let selectors: Vec<&str> = merged.actions.iter().map(|a| a.selector.as_str()).collect();
        assert!(selectors.contains(&"#new"));
        assert!(selectors.contains(&"#keep"));
        assert!(!selectors.contains(&"#stale"));
        assert!(merged.capabilities.contains(&Capability::Navigation));
        assert!(merged.capabilities.contains(&Capability::HasBooking));
    }

    #[test]
    fn merge_without_previous_is_identity() {
        let fresh = manifest(vec![descriptor("#a", "https://x.test/p")], vec![]);
        let merged = merge_manifest(None, fresh.clone(), &HashSet::new());
        assert_eq!(merged.actions.len(), fresh.actions.len());
    }
}
