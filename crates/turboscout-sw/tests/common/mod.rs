//! Shared fixtures for the worker integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use turboscout_test::MockFetcher;
use turboscout_sw::{
    CacheStorage, CacheWorker, Deployment, PageContext, ServiceWorkerContainer, WorkerConfig,
};
use url::Url;

pub const SCOPE: &str = "https://scout.example/";

pub const MANIFEST: &str = r#"{
    "files": { "main.js": "/static/js/main.abc123.js" },
    "entrypoints": ["/static/js/main.abc123.js"]
}"#;

pub fn scope() -> Url {
    Url::parse(SCOPE).unwrap()
}

pub fn url(path: &str) -> Url {
    scope().join(path).unwrap()
}

pub fn script() -> Url {
    url("service-worker.js")
}

/// A deployed build of the app: shell, manifest, one hashed bundle.
pub fn site() -> Arc<MockFetcher> {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.route(SCOPE, 200, "<!doctype html><title>TurboScout</title>");
    fetcher.route(url("index.html").as_str(), 200, "<!doctype html><div id=root></div>");
    fetcher.route(url("asset-manifest.json").as_str(), 200, MANIFEST);
    fetcher.route(url("static/js/main.abc123.js").as_str(), 200, "render(App)");
    fetcher
}

pub fn config(version: &str) -> WorkerConfig {
    WorkerConfig::for_scope(scope()).with_version(version)
}

pub fn deployment(
    config: WorkerConfig,
    caches: &CacheStorage,
    fetcher: &Arc<MockFetcher>,
) -> Arc<Deployment> {
    Arc::new(Deployment::new(config, caches.clone(), fetcher.clone()))
}

pub fn container(
    version: &str,
    caches: &CacheStorage,
    fetcher: &Arc<MockFetcher>,
) -> ServiceWorkerContainer {
    ServiceWorkerContainer::new(
        scope(),
        deployment(config(version), caches, fetcher),
        fetcher.clone(),
    )
}

/// A page that counts reloads.
#[derive(Default)]
pub struct CountingPage {
    reloads: AtomicUsize,
}

impl CountingPage {
    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

impl PageContext for CountingPage {
    fn reload(&self) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
    }
}

/// Wait until `worker` has handled `count` control messages.
pub async fn wait_for_messages(worker: &CacheWorker, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while worker.messages_received() < count {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("worker never received the message");
}
