//! Network fetchers.

use std::time::Duration;

use futures::future::BoxFuture;
use http::header::{CACHE_CONTROL, PRAGMA};
use http::HeaderValue;
use reqwest::Client;
use tracing::{debug, info, trace};

use crate::{CacheMode, NetError, Request, Response};

/// Future returned by [`Fetcher::fetch`].
pub type FetchFuture<'a> = BoxFuture<'a, Result<Response, NetError>>;

/// The network as seen by the worker.
///
/// A fetch resolves to `Ok` for any HTTP status; `Err` means the network itself failed.
pub trait Fetcher: Send + Sync {
    fn fetch<'a>(&'a self, request: &'a Request) -> FetchFuture<'a>;
}

/// Fetcher configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default timeout. `None` waits indefinitely.
    pub default_timeout: Option<Duration>,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("TurboScout-Worker/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: None,
            max_redirects: 10,
        }
    }
}

/// reqwest-backed fetcher.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects));
        if let Some(timeout) = config.default_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self { client })
    }

    async fn execute(&self, request: &Request) -> Result<Response, NetError> {
        debug!(
            request = request.id.raw(),
            url = %request.url,
            method = %request.method,
            "Fetching resource"
        );

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        if request.cache == CacheMode::NoStore {
            req_builder = req_builder
                .header(CACHE_CONTROL, HeaderValue::from_static("no-store"))
                .header(PRAGMA, HeaderValue::from_static("no-cache"));
        }

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(request.timeout.unwrap_or_default())
            } else if e.is_connect() {
                NetError::Offline(e.to_string())
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            url,
            status,
            headers,
            body,
        })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(&'a self, request: &'a Request) -> FetchFuture<'a> {
        Box::pin(self.execute(request))
    }
}

/// A fetcher with no network at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineFetcher;

impl Fetcher for OfflineFetcher {
    fn fetch<'a>(&'a self, request: &'a Request) -> FetchFuture<'a> {
        Box::pin(async move {
            trace!(url = %request.url, "Network disabled");
            Err(NetError::Offline(request.url.to_string()))
        })
    }
}
