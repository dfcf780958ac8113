use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, RETRY_AFTER};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use sitekb_common::{CrawlerConfig, KbError, Result};
use sitekb_storage::DocumentValidators;

use crate::robots::RobotsCache;

/// Result of a conditional fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    /// 304: stored validators still hold, no body returned.
    NotModified,
    /// robots.txt disallows this URL for our user agent.
    Disallowed,
    Fetched(FetchedPage),
}

#[derive(Debug)]
pub struct FetchedPage {
    pub body: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_hash: String,
    pub final_url: String,
}

/// Polite conditional HTTP: validators from prior state, per-host pacing,
/// bounded retries honoring `Retry-After`, robots.txt per host.
pub struct ConditionalFetcher {
    client: reqwest::Client,
    robots: RobotsCache,
    config: CrawlerConfig,
    /// Last request instant per host, for pacing.
    host_state: DashMap<String, Arc<Mutex<Instant>>>,
}

impl ConditionalFetcher {
    pub fn new(config: &CrawlerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()?;
        let robots = RobotsCache::new(
            client.clone(),
            Duration::from_secs(config.robots_cache_ttl_secs),
        );
        Ok(Self {
            client,
            robots,
            config: config.clone(),
            host_state: DashMap::new(),
        })
    }

    /// Robots-declared sitemap URLs for a site.
    pub async fn robots_sitemaps(&self, base_url: &str) -> Result<Vec<String>> {
        let url = Url::parse(base_url)
            .map_err(|e| KbError::InvalidInput(format!("bad url {base_url}: {e}")))?;
        let robots = self.robots.for_url(&url).await?;
        Ok(robots.sitemaps.clone())
    }

    pub fn http_client(&self) -> reqwest::Client {
        self.client.clone()
    }

    /// Wait until this host may be contacted again, then stamp it.
    async fn pace_host(&self, host: &str) {
        let interval = Duration::from_millis(self.config.per_host_interval_ms);
        if interval.is_zero() {
            return;
        }
        let slot = self
            .host_state
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Instant::now() - interval)))
            .clone();
        let mut last = slot.lock().await;
        let elapsed = last.elapsed();
        if elapsed < interval {
            tokio::time::sleep(interval - elapsed).await;
        }
        *last = Instant::now();
    }

    #[instrument(skip(self, validators, cancel), fields(url))]
    pub async fn fetch(
        &self,
        url: &str,
        validators: Option<&DocumentValidators>,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let parsed = Url::parse(url)
            .map_err(|e| KbError::InvalidInput(format!("bad url {url}: {e}")))?;

        if self.config.respect_robots_txt {
            let robots = self.robots.for_url(&parsed).await?;
            if !robots.is_allowed(&self.config.user_agent, parsed.path()) {
                debug!(url, "disallowed by robots.txt");
                return Ok(FetchOutcome::Disallowed);
            }
        }

        let host = parsed.origin().ascii_serialization();
        let mut headers = HeaderMap::new();
        if let Some(v) = validators {
            if let Some(etag) = v.etag.as_deref().and_then(|e| HeaderValue::from_str(e).ok()) {
                headers.insert(IF_NONE_MATCH, etag);
            }
            if let Some(lm) = v
                .last_modified
                .as_deref()
                .and_then(|l| HeaderValue::from_str(l).ok())
            {
                headers.insert(IF_MODIFIED_SINCE, lm);
            }
        }

        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(KbError::Cancelled);
            }
            self.pace_host(&host).await;

            let request = self.client.get(parsed.clone()).headers(headers.clone());
            let response = tokio::select! {
                r = request.send() => r,
                _ = cancel.cancelled() => return Err(KbError::Cancelled),
            };

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::NOT_MODIFIED {
                        return Ok(FetchOutcome::NotModified);
                    }
                    if status.is_success() {
                        return self.read_page(resp, cancel).await;
                    }
                    let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    if !retryable {
                        return Err(KbError::Fetch {
                            url: url.to_string(),
                            status: status.as_u16(),
                        });
                    }
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(KbError::Fetch {
                            url: url.to_string(),
                            status: status.as_u16(),
                        });
                    }
                    let delay = retry_after(resp.headers()).unwrap_or_else(|| backoff(attempt));
                    warn!(url, status = status.as_u16(), delay_ms = delay.as_millis() as u64, "retrying after upstream pushback");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(KbError::Cancelled),
                    }
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return if e.is_timeout() {
                            Err(KbError::Timeout(format!("fetch {url}")))
                        } else {
                            Err(KbError::Transient(format!("fetch {url}: {e}")))
                        };
                    }
                    let delay = backoff(attempt);
                    debug!(url, attempt, error = %e, "network error, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(KbError::Cancelled),
                    }
                }
            }
        }
    }

    async fn read_page(
        &self,
        resp: reqwest::Response,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let etag = header_string(resp.headers(), ETAG.as_str());
        let last_modified = header_string(resp.headers(), LAST_MODIFIED.as_str());
        let final_url = resp.url().to_string();

        let body = tokio::select! {
            b = resp.text() => b?,
            _ = cancel.cancelled() => return Err(KbError::Cancelled),
        };
        let mut body = body;
        if body.len() > self.config.max_body_bytes {
            let mut cut = self.config.max_body_bytes;
            while cut > 0 && !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }

        let content_hash = hex::encode(Sha256::digest(body.as_bytes()));
        Ok(FetchOutcome::Fetched(FetchedPage {
            body,
            etag,
            last_modified,
            content_hash,
            final_url,
        }))
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn backoff(attempt: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..250);
    Duration::from_millis(250u64 * 2u64.pow(attempt.min(6)) + jitter)
}
