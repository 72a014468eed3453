//! Page-side registrar: registers the worker and reloads the page when an update takes over.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{BuildMode, RegistrarConfig};
use crate::container::{ContainerEvent, ServiceWorker, ServiceWorkerContainer};
use crate::message::ControlMessage;
use crate::{ServiceWorkerError, ServiceWorkerState};

/// The page the registrar runs in.
pub trait PageContext: Send + Sync {
    /// Reload the page.
    fn reload(&self);
}

/// What a registrar run did.
#[derive(Debug)]
pub enum RegistrarOutcome {
    /// Not a production build.
    Disabled,
    /// Registration failed. The page carries on uncontrolled.
    Failed(ServiceWorkerError),
    /// A worker was already waiting: it was told to skip waiting and the page reloaded.
    ActivatedWaiting,
    /// Watching for an update. The task resolves `true` once it has reloaded the page.
    Watching(JoinHandle<bool>),
}

/// Registers the cache worker on page load.
#[derive(Debug, Clone, Default)]
pub struct Registrar {
    config: RegistrarConfig,
}

impl Registrar {
    pub fn new(config: RegistrarConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RegistrarConfig {
        &self.config
    }

    /// Run on page load.
    pub async fn register(
        &self,
        container: &ServiceWorkerContainer,
        page: Arc<dyn PageContext>,
    ) -> RegistrarOutcome {
        if self.config.build_mode != BuildMode::Production {
            debug!("Not a production build, skipping worker registration");
            return RegistrarOutcome::Disabled;
        }

        let script_url = match container.scope().join(&self.config.script_path) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Invalid worker script path");
                return RegistrarOutcome::Failed(e.into());
            }
        };

        // Subscribe first so the update this registration may start is not missed.
        let events = container.subscribe();
        let had_controller = container.controller().is_some();

        let registration = match container.register(&script_url).await {
            Ok(registration) => registration,
            Err(e) => {
                warn!(error = %e, "Worker registration failed");
                return RegistrarOutcome::Failed(e);
            }
        };

        if let Some(waiting) = registration.waiting {
            info!(worker = %waiting.id(), "Activating waiting worker");
            activate_and_reload(&waiting, page.as_ref());
            return RegistrarOutcome::ActivatedWaiting;
        }

        RegistrarOutcome::Watching(tokio::spawn(watch_for_update(events, had_controller, page)))
    }
}

async fn watch_for_update(
    mut events: broadcast::Receiver<ContainerEvent>,
    mut has_controller: bool,
    page: Arc<dyn PageContext>,
) -> bool {
    let mut installing: Option<ServiceWorker> = None;

    loop {
        match events.recv().await {
            Ok(ContainerEvent::UpdateFound { worker }) => {
                debug!(worker = %worker.id(), "Update found");
                installing = Some(worker);
            }
            Ok(ContainerEvent::StateChange {
                worker,
                state: ServiceWorkerState::Installed,
            }) => {
                let Some(new_worker) = installing.as_ref().filter(|w| w.id() == worker) else {
                    continue;
                };
                if has_controller {
                    info!(worker = %worker, "New version installed, reloading");
                    activate_and_reload(new_worker, page.as_ref());
                    return true;
                }
                debug!(worker = %worker, "First install, no reload needed");
            }
            Ok(ContainerEvent::ControllerChange { .. }) => has_controller = true,
            Ok(ContainerEvent::StateChange { .. }) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Registrar fell behind on container events");
            }
            Err(RecvError::Closed) => return false,
        }
    }
}

fn activate_and_reload(worker: &ServiceWorker, page: &dyn PageContext) {
    if let Err(e) = worker.post_message(ControlMessage::SkipWaiting) {
        warn!(worker = %worker.id(), error = %e, "Failed to post skip-waiting");
    }
    page.reload();
}
