//! Conditional fetcher tests against a mock site. No external
//! infrastructure required.

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sitekb_common::{CrawlerConfig, KbError};
use sitekb_crawler::{ConditionalFetcher, FetchOutcome};
use sitekb_storage::DocumentValidators;

fn test_config() -> CrawlerConfig {
    CrawlerConfig {
        per_host_interval_ms: 0,
        max_retries: 2,
        fetch_timeout_secs: 5,
        ..CrawlerConfig::default()
    }
}

async fn allow_all_robots(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
}

#[tokio::test]
async fn fresh_fetch_returns_body_and_validators() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"v1\"")
                .insert_header("last-modified", "Wed, 01 Jan 2025 00:00:00 GMT")
                .set_body_string("<html><body>hello</body></html>"),
        )
        .mount(&server)
        .await;

    let fetcher = ConditionalFetcher::new(&test_config()).unwrap();
    let outcome = fetcher
        .fetch(&format!("{}/page", server.uri()), None, &CancellationToken::new())
        .await
        .unwrap();

    match outcome {
        FetchOutcome::Fetched(page) => {
            assert!(page.body.contains("hello"));
            assert_eq!(page.etag.as_deref(), Some("\"v1\""));
            assert_eq!(
                page.last_modified.as_deref(),
                Some("Wed, 01 Jan 2025 00:00:00 GMT")
            );
            assert_eq!(page.content_hash.len(), 64);
        }
        other => panic!("expected Fetched, got {other:?}"),
    }
}

#[tokio::test]
async fn validators_are_sent_and_304_is_unchanged() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .and(header("if-none-match", "\"v1\""))
        .and(header("if-modified-since", "Wed, 01 Jan 2025 00:00:00 GMT"))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = ConditionalFetcher::new(&test_config()).unwrap();
    let validators = DocumentValidators {
        etag: Some("\"v1\"".to_string()),
        last_modified: Some("Wed, 01 Jan 2025 00:00:00 GMT".to_string()),
        content_hash: "abc".to_string(),
    };
    let outcome = fetcher
        .fetch(
            &format!("{}/page", server.uri()),
            Some(&validators),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(matches!(outcome, FetchOutcome::NotModified));
}

#[tokio::test]
async fn client_errors_are_terminal() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = ConditionalFetcher::new(&test_config()).unwrap();
    let result = fetcher
        .fetch(&format!("{}/gone", server.uri()), None, &CancellationToken::new())
        .await;

    match result {
        Err(KbError::Fetch { status, .. }) => assert_eq!(status, 404),
        other => panic!("expected terminal fetch error, got {other:?}"),
    }
}

#[tokio::test]
async fn server_errors_retry_until_cap() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3) // initial attempt + 2 retries
        .mount(&server)
        .await;

    let fetcher = ConditionalFetcher::new(&test_config()).unwrap();
    let result = fetcher
        .fetch(&format!("{}/flaky", server.uri()), None, &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(KbError::Fetch { status: 503, .. })));
}

#[tokio::test]
async fn robots_disallow_is_honored() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private\n"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/private/page"))
        .respond_with(ResponseTemplate::new(200).set_body_string("secret"))
        .expect(0)
        .mount(&server)
        .await;

    let fetcher = ConditionalFetcher::new(&test_config()).unwrap();
    let outcome = fetcher
        .fetch(
            &format!("{}/private/page", server.uri()),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(matches!(outcome, FetchOutcome::Disallowed));
}

#[tokio::test]
async fn robots_sitemaps_are_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "User-agent: *\nAllow: /\nSitemap: {}/special-sitemap.xml\n",
            server.uri()
        )))
        .mount(&server)
        .await;

    let fetcher = ConditionalFetcher::new(&test_config()).unwrap();
    let sitemaps = fetcher.robots_sitemaps(&server.uri()).await.unwrap();
    assert_eq!(sitemaps, vec![format!("{}/special-sitemap.xml", server.uri())]);
}

#[tokio::test]
async fn cancellation_short_circuits() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(10)))
        .mount(&server)
        .await;

    let fetcher = ConditionalFetcher::new(&test_config()).unwrap();
    let cancel = CancellationToken::new();
    let url = format!("{}/slow", server.uri());

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel_clone.cancel();
    });

    let result = fetcher.fetch(&url, None, &cancel).await;
    assert!(matches!(result, Err(KbError::Cancelled)));
}
