//! # TurboScout Offline Worker
//!
//! The offline-caching subsystem of the TurboScout scouting app: a background cache worker
//! that intercepts every request the app makes, keeps a versioned cache of the build's static
//! assets, and serves the app shell when the network is gone, plus the page-side registrar
//! that installs and upgrades it.
//!
//! ## Features
//!
//! - **Cache storage**: named, versioned stores (`turboscout-cache-v4`), optionally persisted
//!   to disk
//! - **Asset discovery**: precache set derived from the build's `asset-manifest.json`
//! - **Lifecycle**: install, activate, fetch events and the `SKIP_WAITING` control message
//! - **Host**: explicit event dispatch loop standing in for the browser's worker runtime
//! - **Registrar**: registers the worker and reloads the page when an update takes over
//!
//! ## Architecture
//!
//! ```text
//! Registrar (page)
//!     │  register / SKIP_WAITING / reload
//!     ▼
//! ServiceWorkerContainer
//!     └── Registration
//!             ├── installing ─┐
//!             ├── waiting     ├── ServiceWorker ── WorkerHandle ──► WorkerHost loop
//!             └── active ─────┘                                       └── CacheWorker
//!                                                                          │
//! CacheStorage ◄───────────────────────────────────────────────────────────┘
//!     └── Cache (turboscout-cache-<version>)
//!             └── CacheKey → CacheEntry
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use turboscout_common::CommonError;
use turboscout_net::NetError;

pub mod cache;
pub mod config;
pub mod container;
pub mod host;
pub mod manifest;
pub mod message;
pub mod registrar;
pub mod storage;
pub mod worker;

pub use cache::{CacheEntry, CacheKey, StoredHeader};
pub use config::{BuildMode, HostConfig, RegistrarConfig, WorkerConfig};
pub use container::{
    ContainerEvent, Deployment, Registration, ServiceWorker, ServiceWorkerContainer,
    WorkerFactory,
};
pub use host::{WorkerEvent, WorkerHandle, WorkerHost};
pub use manifest::{AssetManifest, PrecacheSet};
pub use message::ControlMessage;
pub use registrar::{PageContext, Registrar, RegistrarOutcome};
pub use storage::{Cache, CacheStorage};
pub use worker::{ActivateReport, CacheWorker, FetchResponse, InstallReport, ResponseSource};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Manifest error: {0}")]
    ManifestError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<NetError> for ServiceWorkerError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Timeout(d) => Self::Timeout(d),
            other => Self::NetworkError(other.to_string()),
        }
    }
}

impl From<CommonError> for ServiceWorkerError {
    fn from(err: CommonError) -> Self {
        match err {
            CommonError::Timeout(d) => Self::Timeout(d),
            CommonError::Config { message, .. } => Self::ConfigError(message),
            CommonError::Io(e) => Self::Io(e.to_string()),
        }
    }
}

impl From<std::io::Error> for ServiceWorkerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<url::ParseError> for ServiceWorkerError {
    fn from(err: url::ParseError) -> Self {
        Self::ConfigError(format!("invalid URL: {}", err))
    }
}

/// Result alias for worker operations.
pub type SwResult<T> = Result<T, ServiceWorkerError>;

// ==================== Types ====================

/// Unique identifier for a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Service worker state.
///
/// ```text
/// parsed → installing → installed → activating → activated
///              │            │                        │
///              └────────────┴──────► redundant ◄─────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Script evaluated, no lifecycle event yet.
    #[default]
    Parsed,
    /// Install event running.
    Installing,
    /// Installed and waiting to take over.
    Installed,
    /// Activate event running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Superseded, unregistered, or failed to install.
    Redundant,
}

impl ServiceWorkerState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ServiceWorkerState) -> bool {
        use ServiceWorkerState::*;
        matches!(
            (self, next),
            (Parsed, Installing)
                | (Installing, Installed)
                | (Installed, Activating)
                | (Activating, Activated)
                | (Parsed | Installing | Installed | Activating | Activated, Redundant)
        )
    }

    /// Whether a worker in this state receives fetch events.
    pub fn can_intercept_fetch(&self) -> bool {
        *self == ServiceWorkerState::Activated
    }

    /// Whether the worker can never run again.
    pub fn is_terminal(&self) -> bool {
        *self == ServiceWorkerState::Redundant
    }

    /// String form used on the page side (`worker.state`).
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceWorkerState::Parsed => "parsed",
            ServiceWorkerState::Installing => "installing",
            ServiceWorkerState::Installed => "installed",
            ServiceWorkerState::Activating => "activating",
            ServiceWorkerState::Activated => "activated",
            ServiceWorkerState::Redundant => "redundant",
        }
    }
}

impl std::fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
