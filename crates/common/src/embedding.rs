use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::config::EmbeddingConfig;
use crate::error::{KbError, Result};
use crate::types::EmbeddingModel;

/// Rough token estimate used for budget accounting (≈ 4 chars/token).
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() as u32).div_ceil(4)
}

/// External embedding provider seam. The model dimension is fixed per
/// configuration; callers never pick a dimension at request time.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn model(&self) -> EmbeddingModel;
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// HTTP-backed provider speaking the OpenAI-style `/embeddings` protocol.
/// In-flight requests are bounded by a shared semaphore so crawl and query
/// traffic together respect the provider's rate limits.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: EmbeddingModel,
    permits: Arc<Semaphore>,
}

impl HttpEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() {
            warn!(env = %config.api_key_env, "embedding API key not set; requests will be unauthenticated");
        }
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key,
            model: config.model,
            permits: Arc::new(Semaphore::new(config.request_concurrency.max(1))),
        })
    }

    async fn request(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| KbError::Cancelled)?;

        let mut req = self.client.post(&self.endpoint).json(&serde_json::json!({
            "model": self.model.as_str(),
            "input": inputs,
        }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(KbError::Transient(format!(
                "embedding provider returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(KbError::Embedding(format!(
                "embedding provider returned {status}"
            )));
        }

        let body: EmbeddingResponse = resp.json().await?;
        if body.data.len() != inputs.len() {
            return Err(KbError::Embedding(format!(
                "expected {} embeddings, got {}",
                inputs.len(),
                body.data.len()
            )));
        }
        let dim = self.model.dimensions();
        for datum in &body.data {
            if datum.embedding.len() != dim {
                return Err(KbError::Embedding(format!(
                    "provider returned dimension {}, expected {dim}",
                    datum.embedding.len()
                )));
            }
        }
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    #[instrument(skip_all, fields(text_len = text.len()))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.request(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| KbError::Embedding("empty embedding response".to_string()))
    }

    #[instrument(skip_all, fields(batch = texts.len()))]
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(batch = texts.len(), "embedding batch");
        self.request(texts).await
    }

    fn model(&self) -> EmbeddingModel {
        self.model
    }
}

/// Deterministic bag-of-words hashing embedder. No network, stable across
/// runs; used in tests and offline deployments where the real provider is
/// unavailable.
pub struct HashingEmbedder {
    model: EmbeddingModel,
}

impl HashingEmbedder {
    pub fn new(model: EmbeddingModel) -> Self {
        Self { model }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let dim = self.model.dimensions();
        let mut vector = vec![0f32; dim];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.as_bytes());
            let idx = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize % dim;
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            vector[idx] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }

    fn model(&self) -> EmbeddingModel {
        self.model
    }
}
