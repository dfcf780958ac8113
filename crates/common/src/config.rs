use serde::{Deserialize, Serialize};

use crate::error::{KbError, Result};
use crate::types::EmbeddingModel;

/// Top-level service configuration. Loaded from TOML; connection URLs may
/// be overridden through the environment so deployments never bake
/// credentials into files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub crawler: CrawlerConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub budget: BudgetConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub postgres_url: String,
    pub redis_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            postgres_url: "postgresql://localhost/sitekb".to_string(),
            redis_url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub endpoint: String,
    pub api_key_env: String,
    pub model: EmbeddingModel,
    pub batch_size: usize,
    pub timeout_secs: u64,
    /// Process-wide cap on in-flight embedding requests.
    pub request_concurrency: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/embeddings".to_string(),
            api_key_env: "EMBEDDING_API_KEY".to_string(),
            model: EmbeddingModel::default(),
            batch_size: 32,
            timeout_secs: 30,
            request_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    pub user_agent: String,
    /// Minimum spacing between requests to the same host.
    pub per_host_interval_ms: u64,
    pub max_concurrent_fetches: usize,
    pub fetch_timeout_secs: u64,
    pub max_retries: u32,
    pub sitemap_cache_ttl_secs: u64,
    pub robots_cache_ttl_secs: u64,
    pub max_body_bytes: usize,
    /// Per-session document processing workers.
    pub worker_count: usize,
    pub respect_robots_txt: bool,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: "SiteKBBot/1.0 (+https://sitekb.dev/bot)".to_string(),
            per_host_interval_ms: 500,
            max_concurrent_fetches: 8,
            fetch_timeout_secs: 30,
            max_retries: 3,
            sitemap_cache_ttl_secs: 900,
            robots_cache_ttl_secs: 3600,
            max_body_bytes: 5_000_000,
            worker_count: 4,
            respect_robots_txt: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    pub min_paragraph_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: 400,
            overlap_tokens: 50,
            min_paragraph_chars: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub l1_capacity: u64,
    pub l2_ttl_secs: u64,
    /// Stale-while-revalidate window after TTL expiry.
    pub swr_secs: u64,
    pub search_timeout_ms: u64,
    pub default_top_k: usize,
    pub rrf_k: f64,
    pub vector_weight: f64,
    pub fulltext_weight: f64,
    pub structured_weight: f64,
    /// Candidates fetched per strategy before fusion.
    pub candidate_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 1024,
            l2_ttl_secs: 300,
            swr_secs: 120,
            search_timeout_ms: 300,
            default_top_k: 10,
            rrf_k: 60.0,
            vector_weight: 0.6,
            fulltext_weight: 0.3,
            structured_weight: 0.1,
            candidate_k: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub default_tokens_per_month: f64,
    pub default_actions_per_day: f64,
    pub default_api_calls_per_hour: f64,
    pub default_voice_minutes_per_month: f64,
    pub default_storage_bytes: f64,
    pub warn_threshold: f64,
    pub critical_threshold: f64,
    /// Cadence of the background window resetter.
    pub resetter_interval_secs: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_tokens_per_month: 1_000_000.0,
            default_actions_per_day: 1_000.0,
            default_api_calls_per_hour: 3_600.0,
            default_voice_minutes_per_month: 300.0,
            default_storage_bytes: 1_073_741_824.0,
            warn_threshold: 0.75,
            critical_threshold: 0.90,
            resetter_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            cors_origins: Vec::new(),
        }
    }
}

impl SystemConfig {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: SystemConfig = toml::from_str(&content)
            .map_err(|e| KbError::Config(format!("failed to parse {path}: {e}")))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from `SITEKB_CONFIG` if set, otherwise defaults + env overrides.
    pub fn from_env() -> Result<Self> {
        match std::env::var("SITEKB_CONFIG") {
            Ok(path) => Self::load(&path),
            Err(_) => {
                let mut config = SystemConfig::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("SITEKB_POSTGRES_URL") {
            self.storage.postgres_url = url;
        }
        if let Ok(url) = std::env::var("SITEKB_REDIS_URL") {
            self.storage.redis_url = Some(url);
        }
        if let Ok(endpoint) = std::env::var("SITEKB_EMBEDDING_ENDPOINT") {
            self.embedding.endpoint = endpoint;
        }
        if let Ok(addr) = std::env::var("SITEKB_BIND_ADDR") {
            self.server.bind_addr = addr;
        }
    }
}
