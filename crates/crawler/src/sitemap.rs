use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, instrument, warn};
use url::Url;

use sitekb_common::{KbError, Result};

const MAX_SITEMAP_DEPTH: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct SitemapEntry {
    pub url: String,
    pub lastmod: Option<DateTime<Utc>>,
    pub changefreq: Option<String>,
    pub priority: Option<f32>,
}

#[derive(Debug, Default)]
struct ParsedSitemap {
    entries: Vec<SitemapEntry>,
    nested: Vec<String>,
}

/// `lastmod` values come as full RFC 3339 stamps or bare dates.
fn parse_lastmod(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(stamp) = DateTime::parse_from_rfc3339(value) {
        return Some(stamp.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Parse one sitemap or sitemap-index document.
fn parse_sitemap(xml: &str) -> Result<ParsedSitemap> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut parsed = ParsedSitemap::default();
    let mut in_index_item = false;
    let mut in_url_item = false;
    let mut field: Option<&'static str> = None;

    let mut loc = None;
    let mut lastmod = None;
    let mut changefreq = None;
    let mut priority = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"url" => in_url_item = true,
                b"sitemap" => in_index_item = true,
                b"loc" => field = Some("loc"),
                b"lastmod" => field = Some("lastmod"),
                b"changefreq" => field = Some("changefreq"),
                b"priority" => field = Some("priority"),
                _ => {}
            },
            Ok(Event::Text(text)) => {
                let value = text
                    .unescape()
                    .map_err(|e| KbError::InvalidInput(format!("sitemap text: {e}")))?
                    .to_string();
                match field {
                    Some("loc") => loc = Some(value),
                    Some("lastmod") => lastmod = parse_lastmod(&value),
                    Some("changefreq") => changefreq = Some(value),
                    Some("priority") => priority = value.parse().ok(),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"url" => {
                    if let Some(url) = loc.take() {
                        parsed.entries.push(SitemapEntry {
                            url,
                            lastmod: lastmod.take(),
                            changefreq: changefreq.take(),
                            priority: priority.take(),
                        });
                    }
                    in_url_item = false;
                    lastmod = None;
                    changefreq = None;
                    priority = None;
                }
                b"sitemap" => {
                    if let Some(url) = loc.take() {
                        parsed.nested.push(url);
                    }
                    in_index_item = false;
                    lastmod = None;
                }
                b"loc" | b"lastmod" | b"changefreq" | b"priority" => field = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(KbError::InvalidInput(format!("malformed sitemap XML: {e}")));
            }
            _ => {}
        }
    }

    // A bare <loc> outside url/sitemap items is tolerated but dropped.
    let _ = (in_url_item, in_index_item);
    Ok(parsed)
}

/// Sitemap discovery and delta computation. Contents are cached per
/// sitemap URL with a TTL so repeated delta sessions stay cheap.
pub struct SitemapReader {
    client: reqwest::Client,
    cache: DashMap<String, (Instant, Arc<Vec<SitemapEntry>>)>,
    ttl: Duration,
}

impl SitemapReader {
    pub fn new(client: reqwest::Client, ttl: Duration) -> Self {
        Self {
            client,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// All URL entries reachable from the site's sitemaps: robots-declared
    /// ones plus the conventional root `/sitemap.xml`, with sitemap-index
    /// recursion bounded in depth.
    #[instrument(skip(self, robots_sitemaps))]
    pub async fn discover(
        &self,
        base_url: &str,
        robots_sitemaps: &[String],
    ) -> Result<Vec<SitemapEntry>> {
        let base = Url::parse(base_url)
            .map_err(|e| KbError::InvalidInput(format!("bad base url {base_url}: {e}")))?;
        let root_sitemap = base
            .join("/sitemap.xml")
            .map_err(|e| KbError::InvalidInput(e.to_string()))?
            .to_string();

        let mut queue: Vec<(String, usize)> = Vec::new();
        let mut seen = HashSet::new();
        for url in robots_sitemaps.iter().cloned().chain([root_sitemap]) {
            if seen.insert(url.clone()) {
                queue.push((url, 0));
            }
        }

        let cache_key = format!("{base_url}|{}", robots_sitemaps.join(","));
        if let Some(entry) = self.cache.get(&cache_key) {
            let (at, entries) = entry.value();
            if at.elapsed() < self.ttl {
                debug!(entries = entries.len(), "sitemap cache hit");
                return Ok(entries.as_ref().clone());
            }
        }

        let mut all = Vec::new();
        while let Some((url, depth)) = queue.pop() {
            let xml = match self.fetch_sitemap(&url).await {
                Ok(Some(xml)) => xml,
                Ok(None) => continue,
                Err(e) => {
                    warn!(url = %url, error = %e, "sitemap fetch failed");
                    continue;
                }
            };
            let parsed = match parse_sitemap(&xml) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(url = %url, error = %e, "sitemap parse failed");
                    continue;
                }
            };
            all.extend(parsed.entries);
            if depth < MAX_SITEMAP_DEPTH {
                for nested in parsed.nested {
                    if seen.insert(nested.clone()) {
                        queue.push((nested, depth + 1));
                    }
                }
            }
        }

        // Dedupe by URL, keeping the freshest lastmod.
        all.sort_by(|a, b| a.url.cmp(&b.url).then(b.lastmod.cmp(&a.lastmod)));
        all.dedup_by(|a, b| a.url == b.url);

        self.cache
            .insert(cache_key, (Instant::now(), Arc::new(all.clone())));
        Ok(all)
    }

    async fn fetch_sitemap(&self, url: &str) -> Result<Option<String>> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        Ok(Some(resp.text().await?))
    }

    pub fn invalidate_cache(&self) {
        self.cache.clear();
    }
}

/// The delta set: entries modified after `last_crawl`, plus every entry
/// that does not declare `lastmod` at all (those are verified by
/// conditional fetch instead).
pub fn find_changed_urls(
    entries: &[SitemapEntry],
    last_crawl: Option<DateTime<Utc>>,
) -> Vec<SitemapEntry> {
    let Some(last_crawl) = last_crawl else {
        return entries.to_vec();
    };
    entries
        .iter()
        .filter(|e| match e.lastmod {
            Some(lastmod) => lastmod > last_crawl,
            None => true,
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const URLSET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url>
    <loc>https://acme.test/</loc>
    <lastmod>2024-01-01</lastmod>
    <changefreq>weekly</changefreq>
    <priority>1.0</priority>
  </url>
  <url>
    <loc>https://acme.test/pricing</loc>
    <lastmod>2024-03-15T10:30:00+00:00</lastmod>
  </url>
  <url>
    <loc>https://acme.test/blog</loc>
  </url>
</urlset>"#;

    const INDEX: &str = r#"<?xml version="1.0"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>https://acme.test/sitemap-pages.xml</loc></sitemap>
  <sitemap><loc>https://acme.test/sitemap-blog.xml</loc></sitemap>
</sitemapindex>"#;

    #[test]
    fn urlset_fields_parse() {
        let parsed = parse_sitemap(URLSET).unwrap();
        assert_eq!(parsed.entries.len(), 3);
        assert!(parsed.nested.is_empty());

        let home = &parsed.entries[0];
        assert_eq!(home.url, "https://acme.test/");
        assert_eq!(home.changefreq.as_deref(), Some("weekly"));
        assert_eq!(home.priority, Some(1.0));
        assert!(home.lastmod.is_some());

        let blog = &parsed.entries[2];
        assert!(blog.lastmod.is_none());
    }

    #[test]
    fn sitemap_index_yields_nested() {
        let parsed = parse_sitemap(INDEX).unwrap();
        assert!(parsed.entries.is_empty());
        assert_eq!(parsed.nested.len(), 2);
    }

    #[test]
    fn lastmod_formats() {
        assert!(parse_lastmod("2024-01-01").is_some());
        assert!(parse_lastmod("2024-03-15T10:30:00Z").is_some());
        assert!(parse_lastmod("2024-03-15T10:30:00+02:00").is_some());
        assert!(parse_lastmod("not a date").is_none());
    }

    #[test]
    fn changed_urls_respect_lastmod_and_its_absence() {
        let parsed = parse_sitemap(URLSET).unwrap();
        let cutoff = parse_lastmod("2024-02-01").unwrap();
        let changed = find_changed_urls(&parsed.entries, Some(cutoff));
        let urls: Vec<&str> = changed.iter().map(|e| e.url.as_str()).collect();
        // /pricing is newer; /blog has no lastmod; / is older.
        assert_eq!(urls, vec!["https://acme.test/pricing", "https://acme.test/blog"]);
    }

    #[test]
    fn no_baseline_means_full_set() {
        let parsed = parse_sitemap(URLSET).unwrap();
        assert_eq!(find_changed_urls(&parsed.entries, None).len(), 3);
    }
}
