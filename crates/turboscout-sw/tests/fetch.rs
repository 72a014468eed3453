//! Request interception through an active generation.

mod common;

use common::*;
use http::StatusCode;
use turboscout_net::Request;
use turboscout_sw::{CacheKey, CacheStorage, ResponseSource, ServiceWorkerContainer};
use url::Url;

async fn controlled() -> (
    ServiceWorkerContainer,
    CacheStorage,
    std::sync::Arc<turboscout_test::MockFetcher>,
) {
    let caches = CacheStorage::new();
    let fetcher = site();
    let container = container("v4", &caches, &fetcher);
    container.register(&script()).await.unwrap();
    container.ready().await;
    (container, caches, fetcher)
}

#[tokio::test]
async fn cross_origin_requests_are_not_intercepted() {
    let (container, caches, fetcher) = controlled().await;
    let export = Url::parse("https://docs.google.com/spreadsheets/d/abc/export?format=csv").unwrap();
    fetcher.route(export.as_str(), 200, "team,score\n254,120");

    let controller = container.controller().unwrap();
    assert!(controller
        .handle()
        .fetch(Request::get(export.clone()))
        .await
        .is_none());

    let response = container.fetch(Request::get(export.clone())).await.unwrap();
    assert_eq!(response.source, ResponseSource::Network);

    let cache = caches.open("turboscout-cache-v4").await.unwrap();
    assert!(cache.match_request(&CacheKey::get(&export)).await.is_none());
    assert_eq!(fetcher.request_count(export.as_str()), 1);
}

#[tokio::test]
async fn navigation_offline_returns_cached_document() {
    let (container, _, fetcher) = controlled().await;
    fetcher.set_offline(true);

    let response = container
        .fetch(Request::navigate(url("analysis")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.response.body.as_ref(),
        b"<!doctype html><div id=root></div>"
    );
}

#[tokio::test]
async fn cached_assets_skip_the_network() {
    let (container, _, fetcher) = controlled().await;
    let bundle = url("static/js/main.abc123.js");
    let before = fetcher.total_requests();

    let response = container.fetch(Request::get(bundle)).await.unwrap();
    assert!(response.is_from_cache());
    assert_eq!(response.response.body.as_ref(), b"render(App)");
    assert_eq!(fetcher.total_requests(), before);
}

#[tokio::test]
async fn cache_miss_populates_lazily() {
    let (container, caches, fetcher) = controlled().await;
    let chunk = url("static/js/453.f00d.chunk.js");
    fetcher.route(chunk.as_str(), 200, "lazy()");

    let response = container.fetch(Request::get(chunk.clone())).await.unwrap();
    assert_eq!(response.source, ResponseSource::Network);

    let cache = caches.open("turboscout-cache-v4").await.unwrap();
    let entry = cache.match_request(&CacheKey::get(&chunk)).await.unwrap();
    assert_eq!(entry.status, 200);
    assert_eq!(entry.body, b"lazy()".to_vec());
}

#[tokio::test]
async fn offline_miss_is_synthesized() {
    let (container, _, fetcher) = controlled().await;
    fetcher.set_offline(true);

    let response = container
        .fetch(Request::get(url("logo512.png")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(response.status_text, "Offline");
    assert_eq!(response.source, ResponseSource::Synthesized);
}
