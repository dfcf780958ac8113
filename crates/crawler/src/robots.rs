use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};
use url::Url;

use sitekb_common::Result;

/// One `User-agent` group's rules.
#[derive(Debug, Clone, Default)]
struct RuleGroup {
    agents: Vec<String>,
    /// (allow, path-prefix) in file order.
    rules: Vec<(bool, String)>,
}

/// Parsed robots.txt (RFC 9309 subset: groups, allow/disallow with
/// longest-match precedence, sitemap directives).
#[derive(Debug, Clone, Default)]
pub struct RobotsTxt {
    groups: Vec<RuleGroup>,
    pub sitemaps: Vec<String>,
}

impl RobotsTxt {
    pub fn parse(content: &str) -> Self {
        let mut groups: Vec<RuleGroup> = Vec::new();
        let mut sitemaps = Vec::new();
        let mut current: Option<RuleGroup> = None;
        let mut last_was_agent = false;

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    if last_was_agent {
                        if let Some(group) = current.as_mut() {
                            group.agents.push(value.to_lowercase());
                        }
                    } else {
                        if let Some(group) = current.take() {
                            groups.push(group);
                        }
                        current = Some(RuleGroup {
                            agents: vec![value.to_lowercase()],
                            rules: Vec::new(),
                        });
                    }
                    last_was_agent = true;
                }
                "allow" | "disallow" => {
                    last_was_agent = false;
                    if let Some(group) = current.as_mut() {
                        if !value.is_empty() || key == "disallow" {
                            group.rules.push((key == "allow", value.to_string()));
                        }
                    }
                }
                "sitemap" => {
                    last_was_agent = false;
                    if !value.is_empty() {
                        sitemaps.push(value.to_string());
                    }
                }
                _ => {
                    last_was_agent = false;
                }
            }
        }
        if let Some(group) = current.take() {
            groups.push(group);
        }

        Self { groups, sitemaps }
    }

    /// Group selection: a group naming our product token beats `*`.
    fn group_for(&self, user_agent_token: &str) -> Option<&RuleGroup> {
        let token = user_agent_token.to_lowercase();
        self.groups
            .iter()
            .find(|g| g.agents.iter().any(|a| a != "*" && token.contains(a.as_str())))
            .or_else(|| self.groups.iter().find(|g| g.agents.iter().any(|a| a == "*")))
    }

    /// Longest-match wins; on a tie, allow wins. An empty Disallow means
    /// everything is allowed.
    pub fn is_allowed(&self, user_agent_token: &str, path: &str) -> bool {
        let Some(group) = self.group_for(user_agent_token) else {
            return true;
        };
        let mut best: Option<(usize, bool)> = None;
        for (allow, prefix) in &group.rules {
            if prefix.is_empty() {
                // "Disallow:" (empty) permits everything.
                continue;
            }
            if path.starts_with(prefix.as_str()) {
                let candidate = (prefix.len(), *allow);
                best = match best {
                    Some((len, existing_allow)) => {
                        if candidate.0 > len || (candidate.0 == len && candidate.1 && !existing_allow) {
                            Some(candidate)
                        } else {
                            Some((len, existing_allow))
                        }
                    }
                    None => Some(candidate),
                };
            }
        }
        best.map(|(_, allow)| allow).unwrap_or(true)
    }
}

/// Per-host robots.txt cache with TTL. Unreachable or missing robots.txt
/// fails open (allow everything).
pub struct RobotsCache {
    client: reqwest::Client,
    ttl: Duration,
    entries: DashMap<String, (Instant, Arc<RobotsTxt>)>,
}

impl RobotsCache {
    pub fn new(client: reqwest::Client, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            entries: DashMap::new(),
        }
    }

    pub async fn for_url(&self, url: &Url) -> Result<Arc<RobotsTxt>> {
        let host = url.origin().ascii_serialization();
        if let Some(entry) = self.entries.get(&host) {
            let (fetched_at, robots) = entry.value();
            if fetched_at.elapsed() < self.ttl {
                return Ok(robots.clone());
            }
        }

        let robots_url = format!("{host}/robots.txt");
        let robots = match self.client.get(&robots_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let body = resp.text().await.unwrap_or_default();
                Arc::new(RobotsTxt::parse(&body))
            }
            Ok(resp) => {
                debug!(url = %robots_url, status = %resp.status(), "no robots.txt, failing open");
                Arc::new(RobotsTxt::default())
            }
            Err(e) => {
                warn!(url = %robots_url, error = %e, "robots.txt unreachable, failing open");
                Arc::new(RobotsTxt::default())
            }
        };

        self.entries.insert(host, (Instant::now(), robots.clone()));
        Ok(robots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROBOTS: &str = "\
# example robots file
User-agent: *
Disallow: /admin
Allow: /admin/public
Disallow: /tmp

User-agent: SiteKBBot
Disallow: /private

Sitemap: https://acme.test/sitemap.xml
Sitemap: https://acme.test/news-sitemap.xml
";

    #[test]
    fn sitemaps_are_collected() {
        let robots = RobotsTxt::parse(ROBOTS);
        assert_eq!(robots.sitemaps.len(), 2);
        assert_eq!(robots.sitemaps[0], "https://acme.test/sitemap.xml");
    }

    #[test]
    fn specific_agent_group_wins() {
        let robots = RobotsTxt::parse(ROBOTS);
        // Our token matches the dedicated group, which only blocks /private.
        assert!(!robots.is_allowed("SiteKBBot/1.0", "/private/page"));
        assert!(robots.is_allowed("SiteKBBot/1.0", "/admin"));
        // Unknown agents fall back to *.
        assert!(!robots.is_allowed("OtherBot", "/admin/secret"));
    }

    #[test]
    fn longest_match_and_allow_tiebreak() {
        let robots = RobotsTxt::parse(ROBOTS);
        assert!(!robots.is_allowed("OtherBot", "/admin"));
        assert!(robots.is_allowed("OtherBot", "/admin/public/page"));
        assert!(robots.is_allowed("OtherBot", "/anything-else"));
    }

    #[test]
    fn empty_and_missing_robots_allow_all() {
        let robots = RobotsTxt::parse("");
        assert!(robots.is_allowed("SiteKBBot", "/anywhere"));

        let robots = RobotsTxt::parse("User-agent: *\nDisallow:\n");
        assert!(robots.is_allowed("SiteKBBot", "/anywhere"));
    }
}
