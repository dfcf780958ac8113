//! Delta-first crawling: sitemap discovery, robots-aware conditional
//! fetching, and the sessioned orchestrator that keeps a site's corpus
//! freshness-synchronized.

pub mod fetcher;
pub mod orchestrator;
pub mod robots;
pub mod sitemap;

pub use fetcher::{ConditionalFetcher, FetchOutcome, FetchedPage};
pub use orchestrator::{normalize_url, CompletionHook, CrawlOrchestrator};
pub use robots::{RobotsCache, RobotsTxt};
pub use sitemap::{find_changed_urls, SitemapEntry, SitemapReader};
