use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

/// Thin client for the engine's HTTP surface.
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    async fn handle(resp: reqwest::Response) -> Result<Value> {
        let status = resp.status();
        let body: Value = resp.json().await.context("response was not JSON")?;
        if !status.is_success() {
            let code = body["code"].as_str().unwrap_or("unknown");
            let message = body["error"].as_str().unwrap_or("request failed");
            bail!("{status} [{code}]: {message}");
        }
        Ok(body)
    }

    pub async fn start_crawl(
        &self,
        tenant: &str,
        site: &str,
        base_url: &str,
        full: bool,
    ) -> Result<Value> {
        let resp = self
            .http
            .post(format!("{}/crawl", self.base_url))
            .json(&json!({
                "tenant_id": tenant,
                "site_id": site,
                "base_url": base_url,
                "session_type": if full { "full" } else { "delta" },
            }))
            .send()
            .await?;
        Self::handle(resp).await
    }

    pub async fn session_status(&self, tenant: &str, site: &str, session: &str) -> Result<Value> {
        let resp = self
            .http
            .get(format!("{}/crawl/{tenant}/{site}/{session}", self.base_url))
            .send()
            .await?;
        Self::handle(resp).await
    }

    pub async fn search(&self, tenant: &str, site: &str, query: &str, top_k: usize) -> Result<Value> {
        let resp = self
            .http
            .post(format!("{}/search", self.base_url))
            .json(&json!({
                "tenant_id": tenant,
                "site_id": site,
                "query": query,
                "top_k": top_k,
            }))
            .send()
            .await?;
        Self::handle(resp).await
    }

    pub async fn budget(&self, tenant: &str, site: &str) -> Result<Value> {
        let resp = self
            .http
            .get(format!("{}/budget/{tenant}/{site}", self.base_url))
            .send()
            .await?;
        Self::handle(resp).await
    }

    pub async fn reindex(&self, kind: &str, concurrent: bool) -> Result<Value> {
        let resp = self
            .http
            .post(format!("{}/reindex", self.base_url))
            .json(&json!({ "kind": kind, "concurrent": concurrent }))
            .send()
            .await?;
        Self::handle(resp).await
    }

    pub async fn stats(&self, tenant: &str, site: &str) -> Result<Value> {
        let resp = self
            .http
            .get(format!("{}/stats/{tenant}/{site}", self.base_url))
            .send()
            .await?;
        Self::handle(resp).await
    }
}
