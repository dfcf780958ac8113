use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache as MokaCache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use sitekb_common::{Result, TenantScope};
use sitekb_storage::RedisCache;

/// Filters that participate in the query fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    pub content_types: Vec<String>,
    pub locale: Option<String>,
    pub section: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

/// Stable fingerprint for a search: tenant, site, normalized query text,
/// filter set, and retrieval mode flags. Keys never mix tenants: the
/// scope is both hashed in and kept as a visible prefix.
pub fn query_fingerprint(
    scope: &TenantScope,
    query: &str,
    filters: &SearchFilters,
    strategies: &[String],
    top_k: usize,
) -> String {
    let normalized_query = query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let mut strategies = strategies.to_vec();
    strategies.sort();

    let mut hasher = Sha256::new();
    hasher.update(scope.tenant_id.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(scope.site_id.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(normalized_query.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(serde_json::to_string(filters).unwrap_or_default().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(strategies.join(",").as_bytes());
    hasher.update(b"\x1f");
    hasher.update(top_k.to_le_bytes());

    format!("kbq:{}:{}", scope.tag(), hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<V> {
    /// Within TTL.
    Fresh(V),
    /// TTL expired but inside the stale-while-revalidate window; caller
    /// should serve it and trigger a background refresh.
    Stale(V),
    Miss,
}

#[derive(Clone)]
struct L1Entry<V> {
    value: V,
    stored_at: Instant,
}

#[derive(Serialize, Deserialize)]
struct L2Entry<V> {
    cached_at: DateTime<Utc>,
    payload: V,
}

/// L1 in-process LRU plus optional L2 Redis, both TTL'd, with an SWR
/// window on top. Entries are tagged by scope for targeted invalidation.
pub struct TieredCache<V> {
    l1: MokaCache<String, L1Entry<V>>,
    l2: Option<RedisCache>,
    ttl: Duration,
    swr: Duration,
    /// L1 keys per scope tag, so invalidation can walk them.
    l1_tags: DashMap<String, HashSet<String>>,
}

impl<V> TieredCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(capacity: u64, ttl: Duration, swr: Duration, l2: Option<RedisCache>) -> Self {
        Self {
            l1: MokaCache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl + swr)
                .build(),
            l2,
            ttl,
            swr,
            l1_tags: DashMap::new(),
        }
    }

    fn classify(&self, age: Duration) -> Option<bool> {
        if age < self.ttl {
            Some(true)
        } else if age < self.ttl + self.swr {
            Some(false)
        } else {
            None
        }
    }

    #[instrument(skip(self), fields(key))]
    pub async fn get(&self, key: &str) -> CacheLookup<V> {
        if let Some(entry) = self.l1.get(key).await {
            match self.classify(entry.stored_at.elapsed()) {
                Some(true) => return CacheLookup::Fresh(entry.value),
                Some(false) => return CacheLookup::Stale(entry.value),
                None => self.l1.invalidate(key).await,
            }
        }

        let Some(l2) = &self.l2 else {
            return CacheLookup::Miss;
        };
        let raw = match l2.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return CacheLookup::Miss,
            Err(e) => {
                // A broken cache tier degrades to a miss, never to an error.
                warn!(error = %e, "L2 probe failed");
                return CacheLookup::Miss;
            }
        };
        let entry: L2Entry<V> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "corrupt L2 entry dropped");
                return CacheLookup::Miss;
            }
        };
        let age = (Utc::now() - entry.cached_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        match self.classify(age) {
            Some(true) => {
                // Promote into L1, back-dating so both tiers expire together.
                self.l1
                    .insert(
                        key.to_string(),
                        L1Entry {
                            value: entry.payload.clone(),
                            stored_at: Instant::now() - age,
                        },
                    )
                    .await;
                debug!("L2 hit promoted to L1");
                CacheLookup::Fresh(entry.payload)
            }
            Some(false) => CacheLookup::Stale(entry.payload),
            None => CacheLookup::Miss,
        }
    }

    #[instrument(skip(self, value), fields(key, scope = %scope))]
    pub async fn set(&self, key: &str, value: V, scope: &TenantScope) -> Result<()> {
        self.l1
            .insert(
                key.to_string(),
                L1Entry {
                    value: value.clone(),
                    stored_at: Instant::now(),
                },
            )
            .await;
        self.l1_tags
            .entry(scope.tag())
            .or_default()
            .insert(key.to_string());

        if let Some(l2) = &self.l2 {
            let entry = L2Entry {
                cached_at: Utc::now(),
                payload: value,
            };
            let ttl_secs = (self.ttl + self.swr).as_secs().max(1);
            l2.set_ex(key, &serde_json::to_string(&entry)?, ttl_secs).await?;
            l2.tag_member(&scope_tag_key(scope), key, ttl_secs).await?;
        }
        Ok(())
    }

    /// Remove every entry tagged with the scope from both tiers. After this
    /// returns, no get for a key of this scope observes a pre-invalidation
    /// value.
    #[instrument(skip(self), fields(scope = %scope))]
    pub async fn invalidate(&self, scope: &TenantScope) -> Result<()> {
        if let Some((_, keys)) = self.l1_tags.remove(&scope.tag()) {
            for key in keys {
                self.l1.invalidate(&key).await;
            }
        }

        if let Some(l2) = &self.l2 {
            let tag = scope_tag_key(scope);
            let keys = l2.tag_members(&tag).await?;
            l2.del(&keys).await?;
            l2.drop_tag(&tag).await?;
        }
        debug!("scope invalidated");
        Ok(())
    }

    /// Tenant-wide invalidation: every site scope seen for the tenant.
    pub async fn invalidate_tenant(&self, tenant_tag_prefix: &str) -> Result<()> {
        let scoped: Vec<String> = self
            .l1_tags
            .iter()
            .filter(|entry| entry.key().starts_with(tenant_tag_prefix))
            .map(|entry| entry.key().clone())
            .collect();
        for tag in scoped {
            if let Some((_, keys)) = self.l1_tags.remove(&tag) {
                for key in keys {
                    self.l1.invalidate(&key).await;
                }
            }
            if let Some(l2) = &self.l2 {
                let l2_tag = format!("kbtag:{tag}");
                let keys = l2.tag_members(&l2_tag).await?;
                l2.del(&keys).await?;
                l2.drop_tag(&l2_tag).await?;
            }
        }
        Ok(())
    }
}

fn scope_tag_key(scope: &TenantScope) -> String {
    format!("kbtag:{}", scope.tag())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitekb_common::{SiteId, TenantId};

    fn scope(tenant: &str, site: &str) -> TenantScope {
        TenantScope::new(TenantId::new(tenant), SiteId::new(site)).unwrap()
    }

    fn l1_only(ttl_ms: u64, swr_ms: u64) -> TieredCache<String> {
        TieredCache::new(
            64,
            Duration::from_millis(ttl_ms),
            Duration::from_millis(swr_ms),
            None,
        )
    }

    #[test]
    fn fingerprint_is_stable_and_tenant_scoped() {
        let filters = SearchFilters::default();
        let strategies = vec!["vector".to_string(), "fulltext".to_string()];

        let a = query_fingerprint(&scope("t1", "s1"), "Refund  Policy", &filters, &strategies, 10);
        let b = query_fingerprint(&scope("t1", "s1"), "refund policy", &filters, &strategies, 10);
        assert_eq!(a, b, "whitespace and case normalize away");

        let other_tenant =
            query_fingerprint(&scope("t2", "s1"), "refund policy", &filters, &strategies, 10);
        assert_ne!(a, other_tenant);
        assert!(a.starts_with("kbq:t1:s1:"));
        assert!(other_tenant.starts_with("kbq:t2:s1:"));
    }

    #[test]
    fn fingerprint_varies_with_filters_and_strategies() {
        let strategies = vec!["vector".to_string()];
        let base = query_fingerprint(&scope("t", "s"), "q", &SearchFilters::default(), &strategies, 10);

        let with_locale = query_fingerprint(
            &scope("t", "s"),
            "q",
            &SearchFilters {
                locale: Some("de".to_string()),
                ..SearchFilters::default()
            },
            &strategies,
            10,
        );
        assert_ne!(base, with_locale);

        let reordered = query_fingerprint(
            &scope("t", "s"),
            "q",
            &SearchFilters::default(),
            &["fulltext".to_string(), "vector".to_string()],
            10,
        );
        let canonical = query_fingerprint(
            &scope("t", "s"),
            "q",
            &SearchFilters::default(),
            &["vector".to_string(), "fulltext".to_string()],
            10,
        );
        assert_eq!(reordered, canonical, "strategy order is canonicalized");
    }

    #[tokio::test]
    async fn l1_fresh_then_stale_then_miss() {
        let cache = l1_only(50, 50);
        let scope = scope("t", "s");
        cache.set("k", "value".to_string(), &scope).await.unwrap();

        assert!(matches!(cache.get("k").await, CacheLookup::Fresh(_)));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(cache.get("k").await, CacheLookup::Stale(_)));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(cache.get("k").await, CacheLookup::Miss));
    }

    #[tokio::test]
    async fn invalidation_removes_scoped_entries() {
        let cache = l1_only(10_000, 0);
        let s1 = scope("t", "site-1");
        let s2 = scope("t", "site-2");
        cache.set("k1", "one".to_string(), &s1).await.unwrap();
        cache.set("k2", "two".to_string(), &s2).await.unwrap();

        cache.invalidate(&s1).await.unwrap();

        assert!(matches!(cache.get("k1").await, CacheLookup::Miss));
        assert!(matches!(cache.get("k2").await, CacheLookup::Fresh(_)));
    }

    #[tokio::test]
    async fn tenant_wide_invalidation() {
        let cache = l1_only(10_000, 0);
        cache.set("k1", "one".to_string(), &scope("t", "a")).await.unwrap();
        cache.set("k2", "two".to_string(), &scope("t", "b")).await.unwrap();
        cache.set("k3", "three".to_string(), &scope("u", "c")).await.unwrap();

        cache.invalidate_tenant("t:").await.unwrap();

        assert!(matches!(cache.get("k1").await, CacheLookup::Miss));
        assert!(matches!(cache.get("k2").await, CacheLookup::Miss));
        assert!(matches!(cache.get("k3").await, CacheLookup::Fresh(_)));
    }

    // Exercising the L2 tier requires a live Redis; covered by the ignored
    // integration test in tests/.
}
