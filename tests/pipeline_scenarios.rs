//! End-to-end scenarios stitching transport, classifier, and rewriter
//! together against a real local HTTP server (`mockito`). These exercise
//! one request the way `PipelineOrchestrator::fetch_and_clean_inner` does
//! from the cache-miss point onward, but call `fetch_baseline` directly
//! rather than going through the orchestrator: the orchestrator's SSRF
//! guard correctly refuses loopback addresses, and `mockito` only ever
//! binds to loopback, so a full `fetch_and_clean` call against it would
//! always return `SsrfRefused` regardless of what the mock server answers.

use std::collections::BTreeMap;

use unlock_pipeline::classifier::{classify, Confidence};
use unlock_pipeline::headers::build_browser_headers;
use unlock_pipeline::limiter::PriorityLimiter;
use unlock_pipeline::rewriter::rewrite_html;
use unlock_pipeline::transport::fetch_baseline;

fn client() -> reqwest::Client {
    reqwest::Client::builder().build().unwrap()
}

#[tokio::test]
async fn ok_response_is_rewritten_with_rebased_resources() {
    let mut server = mockito::Server::new_async().await;
    let body = r#"<html><head><link rel="stylesheet" href="/style.css"></head>
        <body><img data-src="/photo.jpg"><a href="/about">About</a></body></html>"#;
    let mock = server
        .mock("GET", "/article")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(body)
        .create_async()
        .await;

    let url = url::Url::parse(&format!("{}/article", server.url())).unwrap();
    let headers = build_browser_headers(None, None);
    let response = fetch_baseline(&client(), &url, &headers, 5.0).await.unwrap();
    mock.assert_async().await;

    let classification = classify(Some(response.status), &response.headers, &response.body, "127.0.0.1");
    assert!(!classification.is_blocked);
    assert_eq!(classification.confidence, Confidence::None);

    let rewritten = rewrite_html(&response.body, &url);
    assert!(rewritten.contains(&format!("{}/style.css", server.url())));
    assert!(rewritten.contains(&format!("{}/about", server.url())));
    assert!(rewritten.contains(&format!("src=\"{}/photo.jpg\"", server.url())));
}

#[tokio::test]
async fn high_confidence_cloudflare_block_is_detected() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/blocked")
        .with_status(403)
        .with_header("server", "cloudflare")
        .with_header("cf-ray", "90f2b2aa1234abcd-DFW")
        .with_body("Sorry, you have been blocked")
        .create_async()
        .await;

    let url = url::Url::parse(&format!("{}/blocked", server.url())).unwrap();
    let headers = build_browser_headers(None, None);
    let response = fetch_baseline(&client(), &url, &headers, 5.0).await.unwrap();
    mock.assert_async().await;

    let classification = classify(Some(response.status), &response.headers, &response.body, "127.0.0.1");
    assert!(classification.is_blocked);
    assert_eq!(classification.confidence, Confidence::High);
}

#[tokio::test]
async fn low_confidence_keyword_hit_is_not_blocked() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/maybe")
        .with_status(200)
        .with_header("server", "LiteSpeed")
        .with_body("Please enable javascript and cookies to continue")
        .create_async()
        .await;

    let url = url::Url::parse(&format!("{}/maybe", server.url())).unwrap();
    let headers = build_browser_headers(None, None);
    let response = fetch_baseline(&client(), &url, &headers, 5.0).await.unwrap();
    mock.assert_async().await;

    let classification = classify(Some(response.status), &response.headers, &response.body, "127.0.0.1");
    assert!(!classification.is_blocked);
    assert_eq!(classification.confidence, Confidence::Low);
}

#[tokio::test]
async fn oversize_body_is_flagged_before_being_read() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/huge")
        .with_status(200)
        .with_header("content-length", "20000000")
        .with_body("short placeholder body, never actually this large")
        .create_async()
        .await;

    let url = url::Url::parse(&format!("{}/huge", server.url())).unwrap();
    let headers = build_browser_headers(None, None);
    let response = fetch_baseline(&client(), &url, &headers, 5.0).await.unwrap();
    mock.assert_async().await;

    assert!(response.too_large);
    assert!(response.body.is_empty());
}

#[tokio::test]
async fn exact_at_cap_content_length_is_accepted() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/exact")
        .with_status(200)
        .with_header(
            "content-length",
            &unlock_pipeline::transport::MAX_PROCESSABLE_PAGE_BYTES.to_string(),
        )
        .with_body("<html>small body, only the header claims the cap size</html>")
        .create_async()
        .await;

    let url = url::Url::parse(&format!("{}/exact", server.url())).unwrap();
    let headers = build_browser_headers(None, None);
    let response = fetch_baseline(&client(), &url, &headers, 5.0).await.unwrap();
    mock.assert_async().await;

    assert!(!response.too_large);
}

#[tokio::test]
async fn priority_ordering_serves_lower_priority_first() {
    let limiter = std::sync::Arc::new(PriorityLimiter::new(1));
    let order = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));

    let held = limiter.limit(0).await;

    let limiter_low = limiter.clone();
    let order_low = order.clone();
    let low_priority_caller = tokio::spawn(async move {
        let _guard = limiter_low.limit(5).await;
        order_low.lock().push("low-priority-caller");
    });
    tokio::task::yield_now().await;

    let limiter_high = limiter.clone();
    let order_high = order.clone();
    let high_priority_caller = tokio::spawn(async move {
        let _guard = limiter_high.limit(0).await;
        order_high.lock().push("high-priority-caller");
    });
    tokio::task::yield_now().await;

    drop(held);
    high_priority_caller.await.unwrap();
    low_priority_caller.await.unwrap();

    assert_eq!(*order.lock(), vec!["high-priority-caller", "low-priority-caller"]);
}

#[tokio::test]
async fn headers_map_round_trips_through_a_real_request() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/echo")
        .match_header("accept-language", mockito::Matcher::Any)
        .with_status(200)
        .with_body("<html>ok</html>")
        .create_async()
        .await;

    let url = url::Url::parse(&format!("{}/echo", server.url())).unwrap();
    let headers = build_browser_headers(Some("test-agent/1.0"), None);
    let response = fetch_baseline(&client(), &url, &headers, 5.0).await.unwrap();
    mock.assert_async().await;
    assert_eq!(response.status, 200);
}

fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[test]
fn waf_status_beats_body_markers_for_any_provider_signal() {
    let h = headers(&[("server", "cloudflare")]);
    let result = classify(Some(429), &h, "nothing suspicious in this body", "example.com");
    assert!(result.is_blocked);
    assert_eq!(result.confidence, Confidence::High);
}
