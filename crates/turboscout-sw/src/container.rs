//! Registration and lifecycle orchestration (`navigator.serviceWorker`).
//!
//! The container owns the registration for one scope and drives each worker through
//! `parsed → installing → installed → activating → activated`, marking superseded and failed
//! workers `redundant`. Page-visible transitions are broadcast as [`ContainerEvent`]s.

use std::sync::Arc;

use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, warn};
use turboscout_net::{Fetcher, Request};
use url::Url;

use crate::config::WorkerConfig;
use crate::host::{WorkerHandle, WorkerHost};
use crate::message::ControlMessage;
use crate::storage::CacheStorage;
use crate::worker::{CacheWorker, FetchResponse};
use crate::{ServiceWorkerError, ServiceWorkerId, ServiceWorkerState, SwResult};

const EVENT_CAPACITY: usize = 64;

// ==================== Deployment ====================

/// Whatever is currently deployed at the worker script URL.
pub trait WorkerFactory: Send + Sync {
    /// Version tag of the deployed script.
    fn version(&self) -> String;

    /// Evaluate the script into a fresh worker.
    fn create(&self) -> SwResult<CacheWorker>;
}

/// A deployed build of the cache worker.
pub struct Deployment {
    config: Arc<WorkerConfig>,
    caches: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
}

impl Deployment {
    pub fn new(config: WorkerConfig, caches: CacheStorage, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config: Arc::new(config),
            caches,
            fetcher,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }
}

impl WorkerFactory for Deployment {
    fn version(&self) -> String {
        self.config.version.clone()
    }

    fn create(&self) -> SwResult<CacheWorker> {
        self.config.validate()?;
        Ok(CacheWorker::new(
            self.config.clone(),
            self.caches.clone(),
            self.fetcher.clone(),
        ))
    }
}

// ==================== Service Worker ====================

/// Page-side view of one worker.
#[derive(Clone, Debug)]
pub struct ServiceWorker {
    /// Script URL.
    pub script_url: Url,

    /// Deployed version tag.
    pub version: String,

    handle: WorkerHandle,
}

impl ServiceWorker {
    pub fn id(&self) -> ServiceWorkerId {
        self.handle.id()
    }

    pub fn state(&self) -> ServiceWorkerState {
        self.handle.state()
    }

    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    /// Post a control message to the worker in its wire form.
    pub fn post_message(&self, message: ControlMessage) -> SwResult<()> {
        self.handle.post_message(message.to_value())
    }

    /// Wait until the worker is at least as far along as `target`.
    ///
    /// Resolves with the observed state, which is `redundant` if the worker died first.
    pub async fn reached(&self, target: ServiceWorkerState) -> ServiceWorkerState {
        let mut rx = self.handle.worker().subscribe_state();
        let observed = rx
            .wait_for(|state| lifecycle_rank(*state) >= lifecycle_rank(target))
            .await
            .map(|state| *state);
        observed.unwrap_or(ServiceWorkerState::Redundant)
    }
}

fn lifecycle_rank(state: ServiceWorkerState) -> u8 {
    match state {
        ServiceWorkerState::Parsed => 0,
        ServiceWorkerState::Installing => 1,
        ServiceWorkerState::Installed => 2,
        ServiceWorkerState::Activating => 3,
        ServiceWorkerState::Activated => 4,
        ServiceWorkerState::Redundant => 5,
    }
}

// ==================== Registration ====================

/// Service worker registration.
#[derive(Clone, Debug)]
pub struct Registration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker.
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,
}

impl Registration {
    fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    fn knows_version(&self, version: &str) -> bool {
        self.workers().any(|w| w.version == version)
    }

    fn workers(&self) -> impl Iterator<Item = &ServiceWorker> {
        self.installing
            .iter()
            .chain(self.waiting.iter())
            .chain(self.active.iter())
    }
}

// ==================== Events ====================

/// Events visible to pages.
#[derive(Clone, Debug)]
pub enum ContainerEvent {
    /// A new worker started installing.
    UpdateFound { worker: ServiceWorker },
    /// A worker changed state.
    StateChange {
        worker: ServiceWorkerId,
        state: ServiceWorkerState,
    },
    /// A worker took control of the page.
    ControllerChange { worker: ServiceWorkerId },
}

// ==================== Container ====================

struct ContainerInner {
    scope: Url,
    factory: RwLock<Arc<dyn WorkerFactory>>,
    registration: RwLock<Option<Registration>>,
    controller: watch::Sender<Option<ServiceWorker>>,
    network: Arc<dyn Fetcher>,
    events: broadcast::Sender<ContainerEvent>,
}

/// Service worker container for one scope.
#[derive(Clone)]
pub struct ServiceWorkerContainer {
    inner: Arc<ContainerInner>,
}

impl ServiceWorkerContainer {
    /// Create a container with nothing registered.
    ///
    /// `network` serves requests the controller declines, or all requests while uncontrolled.
    pub fn new(scope: Url, factory: Arc<dyn WorkerFactory>, network: Arc<dyn Fetcher>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (controller, _) = watch::channel(None);
        Self {
            inner: Arc::new(ContainerInner {
                scope,
                factory: RwLock::new(factory),
                registration: RwLock::new(None),
                controller,
                network,
                events,
            }),
        }
    }

    pub fn scope(&self) -> &Url {
        &self.inner.scope
    }

    /// Subscribe to page-visible events.
    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.inner.events.subscribe()
    }

    /// Worker controlling the page.
    pub fn controller(&self) -> Option<ServiceWorker> {
        self.inner.controller.borrow().clone()
    }

    /// Snapshot of the registration.
    pub async fn registration(&self) -> Option<Registration> {
        self.inner.registration.read().await.clone()
    }

    /// Resolves once a worker controls the page.
    pub async fn ready(&self) -> ServiceWorker {
        let mut rx = self.inner.controller.subscribe();
        loop {
            if let Some(worker) = rx.borrow_and_update().clone() {
                return worker;
            }
            // The sender lives in `self`.
            let _ = rx.changed().await;
        }
    }

    /// Replace what is deployed at the script URL. Picked up by the next `register`.
    pub async fn deploy(&self, factory: Arc<dyn WorkerFactory>) {
        debug!(version = %factory.version(), "New deployment");
        *self.inner.factory.write().await = factory;
    }

    /// Register the worker script, starting an install if the deployed version is new.
    ///
    /// Returns the registration as it was when the call completed. The install itself
    /// proceeds in the background.
    pub async fn register(&self, script_url: &Url) -> SwResult<Registration> {
        if script_url.origin() != self.inner.scope.origin() {
            return Err(ServiceWorkerError::RegistrationFailed(format!(
                "script {} is not same-origin with scope {}",
                script_url, self.inner.scope
            )));
        }

        let factory = self.inner.factory.read().await.clone();
        let version = factory.version();

        let mut guard = self.inner.registration.write().await;
        let registration =
            guard.get_or_insert_with(|| Registration::new(self.inner.scope.clone()));

        if registration.knows_version(&version) {
            debug!(%version, "Deployed version already registered");
            return Ok(registration.clone());
        }
        if registration.installing.is_some() {
            debug!(%version, "Install already in progress");
            return Ok(registration.clone());
        }

        let worker = factory
            .create()
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;
        let sw = ServiceWorker {
            script_url: script_url.clone(),
            version,
            handle: WorkerHost::spawn(Arc::new(worker)),
        };
        info!(worker = %sw.id(), version = %sw.version, "Update found");

        registration.installing = Some(sw.clone());
        self.transition(&sw, ServiceWorkerState::Installing);
        let _ = self
            .inner
            .events
            .send(ContainerEvent::UpdateFound { worker: sw.clone() });

        let snapshot = registration.clone();
        drop(guard);

        tokio::spawn(self.clone().run_update(sw));
        Ok(snapshot)
    }

    async fn run_update(self, sw: ServiceWorker) {
        if let Err(e) = sw.handle.install().await {
            warn!(worker = %sw.id(), error = %e, "Install failed, keeping previous generation");
            let mut guard = self.inner.registration.write().await;
            if let Some(registration) = guard.as_mut() {
                if is_same(&registration.installing, &sw) {
                    registration.installing = None;
                }
            }
            self.transition(&sw, ServiceWorkerState::Redundant);
            return;
        }

        let has_active = {
            let mut guard = self.inner.registration.write().await;
            let Some(registration) = guard.as_mut() else {
                self.transition(&sw, ServiceWorkerState::Redundant);
                return;
            };
            if !is_same(&registration.installing, &sw) {
                self.transition(&sw, ServiceWorkerState::Redundant);
                return;
            }
            registration.installing = None;
            if let Some(previous) = registration.waiting.replace(sw.clone()) {
                self.transition(&previous, ServiceWorkerState::Redundant);
            }
            self.transition(&sw, ServiceWorkerState::Installed);
            registration.active.is_some()
        };

        let worker = sw.handle.worker().clone();
        if !has_active || worker.skip_waiting_requested() {
            self.activate(&sw).await;
            return;
        }

        debug!(worker = %sw.id(), "Waiting for skip-waiting");
        let mut state = worker.subscribe_state();
        let superseded = async move {
            let _ = state.wait_for(|s| s.is_terminal()).await;
        };
        tokio::select! {
            _ = worker.skip_waiting_signal() => self.activate(&sw).await,
            _ = superseded => {
                debug!(worker = %sw.id(), "Waiting worker became redundant");
            }
        }
    }

    async fn activate(&self, sw: &ServiceWorker) {
        {
            let mut guard = self.inner.registration.write().await;
            let Some(registration) = guard.as_mut() else {
                return;
            };
            if !is_same(&registration.waiting, sw) {
                return;
            }
            registration.waiting = None;
            if let Some(previous) = registration.active.replace(sw.clone()) {
                self.transition(&previous, ServiceWorkerState::Redundant);
            }
            self.transition(sw, ServiceWorkerState::Activating);
        }

        if let Err(e) = sw.handle.activate().await {
            warn!(worker = %sw.id(), error = %e, "Activate handler failed");
        }
        self.transition(sw, ServiceWorkerState::Activated);
        self.set_controller(sw);
    }

    fn set_controller(&self, sw: &ServiceWorker) {
        self.inner.controller.send_replace(Some(sw.clone()));
        info!(worker = %sw.id(), version = %sw.version, "Controller changed");
        let _ = self
            .inner
            .events
            .send(ContainerEvent::ControllerChange { worker: sw.id() });
    }

    fn transition(&self, sw: &ServiceWorker, state: ServiceWorkerState) {
        match sw.handle.worker().set_state(state) {
            Ok(()) => {
                let _ = self.inner.events.send(ContainerEvent::StateChange {
                    worker: sw.id(),
                    state,
                });
            }
            Err(e) => warn!(error = %e, "Ignoring invalid state change"),
        }
    }

    /// Resume the deployed generation from existing storage without reinstalling.
    ///
    /// Fails with `NotFound` if that generation was never installed.
    pub async fn resume(&self, script_url: &Url) -> SwResult<ServiceWorker> {
        let factory = self.inner.factory.read().await.clone();
        let worker = factory.create()?;
        let generation = worker.config().generation_id();
        if !worker.caches().has(&generation).await {
            return Err(ServiceWorkerError::NotFound(format!(
                "generation {} is not installed",
                generation
            )));
        }
        worker.restore_active();

        let sw = ServiceWorker {
            script_url: script_url.clone(),
            version: factory.version(),
            handle: WorkerHost::spawn(Arc::new(worker)),
        };
        {
            let mut guard = self.inner.registration.write().await;
            let registration =
                guard.get_or_insert_with(|| Registration::new(self.inner.scope.clone()));
            if let Some(previous) = registration.active.replace(sw.clone()) {
                self.transition(&previous, ServiceWorkerState::Redundant);
            }
        }
        self.set_controller(&sw);
        Ok(sw)
    }

    /// Fetch on behalf of the page: through the controller, else the network.
    pub async fn fetch(&self, request: Request) -> SwResult<FetchResponse> {
        if let Some(controller) = self.controller() {
            if let Some(response) = controller.handle.fetch(request.clone()).await {
                return Ok(response);
            }
        }
        let response = self.inner.network.fetch(&request).await?;
        Ok(FetchResponse::from_network(response))
    }

    /// Drop the registration. Every worker becomes redundant and the page is uncontrolled.
    pub async fn unregister(&self) -> bool {
        let Some(registration) = self.inner.registration.write().await.take() else {
            return false;
        };
        for sw in registration.workers() {
            self.transition(sw, ServiceWorkerState::Redundant);
        }
        self.inner.controller.send_replace(None);
        info!(scope = %self.inner.scope, "Unregistered");
        true
    }
}

impl std::fmt::Debug for ServiceWorkerContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorkerContainer")
            .field("scope", &self.inner.scope.as_str())
            .finish_non_exhaustive()
    }
}

fn is_same(slot: &Option<ServiceWorker>, sw: &ServiceWorker) -> bool {
    slot.as_ref().map(ServiceWorker::id) == Some(sw.id())
}
