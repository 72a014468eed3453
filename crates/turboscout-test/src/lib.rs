//! # TurboScout Test
//!
//! Test doubles for the TurboScout offline worker crates.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use turboscout_test::MockFetcher;
//!
//! let site = MockFetcher::new();
//! site.route("https://scout.example/index.html", 200, "<html></html>");
//! site.fail_times("https://scout.example/static/js/main.js", 1);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use http::StatusCode;
use turboscout_net::{CacheMode, FetchFuture, Fetcher, NetError, Request, Response};

#[derive(Default)]
struct MockState {
    routes: HashMap<String, (StatusCode, Bytes)>,
    failures: HashSet<String>,
    flaky: HashMap<String, usize>,
    stalled: HashSet<String>,
    offline: bool,
    requests: HashMap<String, usize>,
    no_store: HashSet<String>,
}

/// A [`Fetcher`] answering from a route table.
///
/// Unknown URLs get `404`. Every attempt is counted, including ones that fail.
#[derive(Default)]
pub struct MockFetcher {
    state: Mutex<MockState>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Serve `body` with `status` for `url`.
    pub fn route(&self, url: &str, status: u16, body: impl Into<Bytes>) {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut state = self.lock();
        state.failures.remove(url);
        state.routes.insert(url.to_string(), (status, body.into()));
    }

    /// Make requests for `url` fail at the network level.
    pub fn fail(&self, url: &str) {
        self.lock().failures.insert(url.to_string());
    }

    /// Make the next `times` requests for `url` fail at the network level.
    pub fn fail_times(&self, url: &str, times: usize) {
        self.lock().flaky.insert(url.to_string(), times);
    }

    /// Make requests for `url` never complete.
    pub fn stall(&self, url: &str) {
        self.lock().stalled.insert(url.to_string());
    }

    /// Fail every request.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Requests attempted for `url`.
    pub fn request_count(&self, url: &str) -> usize {
        self.lock().requests.get(url).copied().unwrap_or(0)
    }

    /// Requests attempted for any URL.
    pub fn total_requests(&self) -> usize {
        self.lock().requests.values().sum()
    }

    /// Whether `url` was ever requested with caching disabled.
    pub fn saw_no_store(&self, url: &str) -> bool {
        self.lock().no_store.contains(url)
    }

    fn answer(&self, request: &Request) -> (bool, Result<Response, NetError>) {
        let url = request.url.as_str();
        let mut state = self.lock();
        *state.requests.entry(url.to_string()).or_default() += 1;
        if request.cache == CacheMode::NoStore {
            state.no_store.insert(url.to_string());
        }

        let stalled = state.stalled.contains(url);
        let flaky = match state.flaky.get_mut(url) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        let result = if state.offline || flaky || state.failures.contains(url) {
            Err(NetError::Offline(url.to_string()))
        } else {
            let (status, body) = state
                .routes
                .get(url)
                .cloned()
                .unwrap_or((StatusCode::NOT_FOUND, Bytes::new()));
            Ok(Response::new(request.url.clone(), status, body))
        };
        (stalled, result)
    }
}

impl Fetcher for MockFetcher {
    fn fetch<'a>(&'a self, request: &'a Request) -> FetchFuture<'a> {
        Box::pin(async move {
            let (stalled, result) = self.answer(request);
            if stalled {
                futures::future::pending::<()>().await;
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    #[tokio::test]
    async fn test_routes_failures_and_counts() {
        let fetcher = MockFetcher::new();
        let a = Url::parse("https://scout.example/a.js").unwrap();
        fetcher.route(a.as_str(), 200, "a");

        let response = fetcher.fetch(&Request::get(a.clone())).await.unwrap();
        assert_eq!(response.body, Bytes::from_static(b"a"));

        let missing = Url::parse("https://scout.example/b.js").unwrap();
        let response = fetcher.fetch(&Request::get(missing)).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);

        fetcher.set_offline(true);
        assert!(fetcher.fetch(&Request::get(a.clone())).await.is_err());
        assert_eq!(fetcher.request_count(a.as_str()), 2);
        assert_eq!(fetcher.total_requests(), 3);
    }

    #[tokio::test]
    async fn test_fail_times_recovers() {
        let fetcher = MockFetcher::new();
        let a = Url::parse("https://scout.example/a.js").unwrap();
        fetcher.route(a.as_str(), 200, "a");
        fetcher.fail_times(a.as_str(), 2);

        assert!(fetcher.fetch(&Request::get(a.clone())).await.is_err());
        assert!(fetcher.fetch(&Request::get(a.clone())).await.is_err());
        assert!(fetcher.fetch(&Request::get(a.clone())).await.is_ok());
        assert_eq!(fetcher.request_count(a.as_str()), 3);
    }
}
