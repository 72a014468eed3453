//! The cache worker: install, activate, fetch and message handlers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, StatusCode};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use turboscout_common::{with_timeout, RetryConfig};
use turboscout_net::{Fetcher, Request, Response};
use url::Url;

use crate::cache::{CacheEntry, CacheKey};
use crate::config::WorkerConfig;
use crate::manifest::{AssetManifest, PrecacheSet};
use crate::message::ControlMessage;
use crate::storage::{Cache, CacheStorage};
use crate::{ServiceWorkerError, ServiceWorkerId, ServiceWorkerState, SwResult};

// ==================== Reports ====================

/// Outcome of a successful install.
#[derive(Debug, Clone)]
pub struct InstallReport {
    /// Generation that was populated.
    pub generation: String,

    /// Every URL stored during install.
    pub precached: PrecacheSet,

    /// Why the manifest-derived set was skipped, if it was.
    pub manifest_error: Option<String>,
}

/// Outcome of activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateReport {
    pub generation: String,

    /// Stale generations that were deleted.
    pub deleted: Vec<String>,
}

// ==================== Fetch Response ====================

/// Where a response handed to the page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
    Synthesized,
}

impl std::fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ResponseSource::Cache => "cache",
            ResponseSource::Network => "network",
            ResponseSource::Synthesized => "synthesized",
        })
    }
}

/// Response produced by the fetch handler.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub response: Response,

    /// Status text.
    pub status_text: String,

    pub source: ResponseSource,
}

impl FetchResponse {
    /// Create a response from cache entry.
    pub fn from_cache(entry: &CacheEntry) -> Option<Self> {
        Some(Self {
            response: entry.to_response()?,
            status_text: entry.status_text.clone(),
            source: ResponseSource::Cache,
        })
    }

    /// Wrap a response that came straight from the network.
    pub fn from_network(response: Response) -> Self {
        Self {
            status_text: response
                .status
                .canonical_reason()
                .unwrap_or_default()
                .to_string(),
            response,
            source: ResponseSource::Network,
        }
    }

    /// `503` with body `Offline`, for navigations with nothing cached.
    pub fn offline_navigation(url: Url) -> Self {
        let mut response = Response::new(url, StatusCode::SERVICE_UNAVAILABLE, "Offline");
        response.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain;charset=UTF-8"),
        );
        Self {
            response,
            status_text: "Offline".to_string(),
            source: ResponseSource::Synthesized,
        }
    }

    /// `504` with an empty body, for subresources with nothing cached.
    pub fn offline_asset(url: Url) -> Self {
        Self {
            response: Response::new(url, StatusCode::GATEWAY_TIMEOUT, ""),
            status_text: "Offline".to_string(),
            source: ResponseSource::Synthesized,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.response.status
    }

    pub fn is_from_cache(&self) -> bool {
        self.source == ResponseSource::Cache
    }
}

// ==================== Cache Worker ====================

/// One generation of the offline cache worker.
///
/// Handlers take `&self` so the host can run fetches concurrently. The only shared mutable
/// resource is the [`CacheStorage`].
pub struct CacheWorker {
    id: ServiceWorkerId,
    config: Arc<WorkerConfig>,
    caches: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    state: watch::Sender<ServiceWorkerState>,
    skip_waiting: watch::Sender<bool>,
    messages_received: AtomicUsize,
    clients_claimed: AtomicBool,
}

impl CacheWorker {
    /// Create a worker in the `parsed` state.
    pub fn new(config: Arc<WorkerConfig>, caches: CacheStorage, fetcher: Arc<dyn Fetcher>) -> Self {
        let (state, _) = watch::channel(ServiceWorkerState::Parsed);
        let (skip_waiting, _) = watch::channel(false);
        Self {
            id: ServiceWorkerId::new(),
            config,
            caches,
            fetcher,
            state,
            skip_waiting,
            messages_received: AtomicUsize::new(0),
            clients_claimed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceWorkerState {
        *self.state.borrow()
    }

    /// Watch lifecycle state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ServiceWorkerState> {
        self.state.subscribe()
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub(crate) fn set_state(&self, next: ServiceWorkerState) -> SwResult<()> {
        let mut result = Ok(());
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if current.can_transition_to(next) {
                debug!(worker = %self.id, from = %current, to = %next, "State change");
                *current = next;
                true
            } else {
                result = Err(ServiceWorkerError::StateError(format!(
                    "{} cannot move from {} to {}",
                    self.id, current, next
                )));
                false
            }
        });
        result
    }

    /// Resume an already-populated generation as the active worker.
    pub(crate) fn restore_active(&self) {
        self.state.send_replace(ServiceWorkerState::Activated);
        self.clients_claimed.store(true, Ordering::SeqCst);
        debug!(worker = %self.id, generation = %self.config.generation_id(), "Restored active worker");
    }

    // ---------- install ----------

    /// Handle the install event.
    ///
    /// Fails only when the shell cannot be precached, or when the configured install deadline
    /// passes.
    pub async fn install(&self) -> SwResult<InstallReport> {
        match self.config.install_timeout() {
            Some(limit) => with_timeout(limit, || self.run_install()).await?,
            None => self.run_install().await,
        }
    }

    async fn run_install(&self) -> SwResult<InstallReport> {
        let generation = self.config.generation_id();
        info!(worker = %self.id, %generation, "Installing generation");

        let cache = self.caches.open(&generation).await?;
        let retry = self.config.precache_retry();

        let shell = self.config.shell_urls()?;
        if let Err(e) = cache.add_all(self.fetcher.as_ref(), &shell, &retry).await {
            warn!(worker = %self.id, error = %e, "Shell precache failed");
            return Err(e);
        }

        let (assets, manifest_error) = match self.precache_manifest(&cache, &retry).await {
            Ok(assets) => (assets, None),
            Err(e) => {
                warn!(
                    worker = %self.id,
                    error = %e,
                    "Manifest precache failed, continuing with shell only"
                );
                (PrecacheSet::new(), Some(e.to_string()))
            }
        };
        let precached = assets.with_shell(&shell);

        if self.config.skip_waiting_on_install {
            self.skip_waiting();
        }

        info!(
            worker = %self.id,
            %generation,
            entries = precached.len(),
            "Generation installed"
        );
        Ok(InstallReport {
            generation,
            precached,
            manifest_error,
        })
    }

    async fn precache_manifest(&self, cache: &Cache, retry: &RetryConfig) -> SwResult<PrecacheSet> {
        let request = Request::get(self.config.manifest_url()?).no_store();
        let response = self.fetcher.fetch(&request).await?;
        if !response.ok() {
            return Err(ServiceWorkerError::ManifestError(format!(
                "{} returned {}",
                request.url, response.status
            )));
        }

        let manifest = AssetManifest::parse(&response.body)?;
        let origin = self.config.scope.join("/")?;
        let assets = manifest.precache_set(&origin);
        debug!(worker = %self.id, count = assets.len(), "Manifest assets discovered");

        if !assets.is_empty() {
            cache
                .add_all(self.fetcher.as_ref(), &assets.to_vec(), retry)
                .await?;
        }
        Ok(assets)
    }

    // ---------- activate ----------

    /// Handle the activate event: drop stale generations and claim clients.
    pub async fn activate(&self) -> SwResult<ActivateReport> {
        let generation = self.config.generation_id();
        let deleted = self.delete_stale_generations().await?;
        self.clients_claimed.store(true, Ordering::SeqCst);

        info!(worker = %self.id, %generation, deleted = deleted.len(), "Generation activated");
        Ok(ActivateReport {
            generation,
            deleted,
        })
    }

    /// Delete every store of this app other than the current generation.
    pub async fn delete_stale_generations(&self) -> SwResult<Vec<String>> {
        let mut deleted = Vec::new();
        for name in self.caches.keys().await {
            if self.config.is_stale_generation(&name) && self.caches.delete(&name).await? {
                debug!(worker = %self.id, cache = %name, "Deleted stale generation");
                deleted.push(name);
            }
        }
        Ok(deleted)
    }

    /// Whether the activate handler has claimed open clients.
    pub fn clients_claimed(&self) -> bool {
        self.clients_claimed.load(Ordering::SeqCst)
    }

    // ---------- fetch ----------

    /// Handle a fetch event.
    ///
    /// `None` means the worker declines and the platform should use the network untouched.
    pub async fn handle_fetch(&self, request: &Request) -> Option<FetchResponse> {
        if !self.state().can_intercept_fetch() {
            trace!(worker = %self.id, url = %request.url, state = %self.state(), "Not active, declining");
            return None;
        }
        if request.url.origin() != self.config.scope.origin() {
            trace!(worker = %self.id, url = %request.url, "Cross-origin, passing through");
            return None;
        }

        let cache = match self.caches.open(&self.config.generation_id()).await {
            Ok(cache) => cache,
            Err(e) => {
                warn!(worker = %self.id, error = %e, "Cannot open cache, declining");
                return None;
            }
        };

        if request.is_navigation() {
            let document = self.config.document_url().ok()?;
            Some(self.serve_navigation(&cache, request, &CacheKey::get(&document)).await)
        } else {
            Some(self.serve_asset(&cache, request).await)
        }
    }

    async fn serve_navigation(
        &self,
        cache: &Cache,
        request: &Request,
        document: &CacheKey,
    ) -> FetchResponse {
        if let Some(hit) = cached(cache, document).await {
            trace!(url = %request.url, "Navigation served from cached document");
            return hit;
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => FetchResponse::from_network(response),
            Err(e) => {
                debug!(url = %request.url, error = %e, "Navigation failed");
                match cached(cache, document).await {
                    Some(hit) => hit,
                    None => FetchResponse::offline_navigation(request.url.clone()),
                }
            }
        }
    }

    async fn serve_asset(&self, cache: &Cache, request: &Request) -> FetchResponse {
        let key = CacheKey::for_request(request);
        let is_get = request.method == Method::GET;

        if is_get {
            if let Some(hit) = cached(cache, &key).await {
                trace!(%key, "Cache hit");
                return hit;
            }
            trace!(%key, "Cache miss");
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if is_get && response.ok() {
                    if let Err(e) = cache.put(&key, &response).await {
                        warn!(%key, error = %e, "Failed to store response");
                    }
                }
                FetchResponse::from_network(response)
            }
            Err(e) => {
                debug!(%key, error = %e, "Network failed");
                FetchResponse::offline_asset(request.url.clone())
            }
        }
    }

    // ---------- messages ----------

    /// Handle a control message posted by a page.
    pub fn handle_message(&self, message: &ControlMessage) {
        self.messages_received.fetch_add(1, Ordering::SeqCst);
        match message {
            ControlMessage::SkipWaiting => self.skip_waiting(),
            ControlMessage::Unknown => {
                debug!(worker = %self.id, "Ignoring unknown control message")
            }
        }
    }

    /// Number of control messages received.
    pub fn messages_received(&self) -> usize {
        self.messages_received.load(Ordering::SeqCst)
    }

    /// Ask to be activated without waiting for old clients to go away.
    pub fn skip_waiting(&self) {
        if !self.skip_waiting.send_replace(true) {
            debug!(worker = %self.id, "Skip waiting requested");
        }
    }

    pub fn skip_waiting_requested(&self) -> bool {
        *self.skip_waiting.borrow()
    }

    /// Resolves once skip-waiting has been requested.
    pub async fn skip_waiting_signal(&self) {
        let mut rx = self.skip_waiting.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

impl std::fmt::Debug for CacheWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWorker")
            .field("id", &self.id)
            .field("generation", &self.config.generation_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

async fn cached(cache: &Cache, key: &CacheKey) -> Option<FetchResponse> {
    let entry = cache.match_request(key).await?;
    FetchResponse::from_cache(&entry)
}
