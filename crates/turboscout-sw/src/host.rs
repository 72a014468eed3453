//! Event dispatch loop that runs a [`CacheWorker`].
//!
//! Install and activate are handled one at a time in arrival order and reply when the handler
//! future completes. Each fetch runs in its own task so a slow network never blocks siblings.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};
use turboscout_net::Request;

use crate::message::ControlMessage;
use crate::worker::{ActivateReport, CacheWorker, FetchResponse, InstallReport};
use crate::{ServiceWorkerError, ServiceWorkerId, ServiceWorkerState, SwResult};

/// Events delivered to a worker.
#[derive(Debug)]
pub enum WorkerEvent {
    Install {
        reply: oneshot::Sender<SwResult<InstallReport>>,
    },
    Activate {
        reply: oneshot::Sender<SwResult<ActivateReport>>,
    },
    Fetch {
        request: Request,
        reply: oneshot::Sender<Option<FetchResponse>>,
    },
    /// A value posted by a page, decoded by the loop.
    Message(Value),
}

/// Spawns worker dispatch loops.
pub struct WorkerHost;

impl WorkerHost {
    /// Start a dispatch loop for `worker`. The loop ends when every handle is dropped.
    pub fn spawn(worker: Arc<CacheWorker>) -> WorkerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run(worker.clone(), rx));
        WorkerHandle { worker, tx }
    }

    async fn run(worker: Arc<CacheWorker>, mut rx: mpsc::UnboundedReceiver<WorkerEvent>) {
        debug!(worker = %worker.id(), "Worker host started");

        while let Some(event) = rx.recv().await {
            match event {
                WorkerEvent::Install { reply } => {
                    let _ = reply.send(worker.install().await);
                }
                WorkerEvent::Activate { reply } => {
                    let _ = reply.send(worker.activate().await);
                }
                WorkerEvent::Fetch { request, reply } => {
                    let worker = worker.clone();
                    tokio::spawn(async move {
                        let response = worker.handle_fetch(&request).await;
                        let _ = reply.send(response);
                    });
                }
                WorkerEvent::Message(value) => match ControlMessage::from_value(&value) {
                    Some(message) => {
                        trace!(worker = %worker.id(), ?message, "Message");
                        worker.handle_message(&message);
                    }
                    None => debug!(worker = %worker.id(), %value, "Ignoring non-message post"),
                },
            }
        }

        debug!(worker = %worker.id(), "Worker host stopped");
    }
}

/// Sender side of a worker's dispatch loop.
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    worker: Arc<CacheWorker>,
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerHandle {
    pub fn id(&self) -> ServiceWorkerId {
        self.worker.id()
    }

    pub fn state(&self) -> ServiceWorkerState {
        self.worker.state()
    }

    pub fn worker(&self) -> &Arc<CacheWorker> {
        &self.worker
    }

    /// Dispatch the install event and wait for it to settle.
    pub async fn install(&self) -> SwResult<InstallReport> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerEvent::Install { reply })?;
        rx.await.map_err(|_| self.stopped())?
    }

    /// Dispatch the activate event and wait for it to settle.
    pub async fn activate(&self) -> SwResult<ActivateReport> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerEvent::Activate { reply })?;
        rx.await.map_err(|_| self.stopped())?
    }

    /// Dispatch a fetch event. `None` when the worker declines or is gone.
    pub async fn fetch(&self, request: Request) -> Option<FetchResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerEvent::Fetch { request, reply }).ok()?;
        rx.await.ok().flatten()
    }

    /// Post a value to the worker, e.g. `{ "type": "SKIP_WAITING" }`. There is no
    /// acknowledgment.
    pub fn post_message(&self, value: Value) -> SwResult<()> {
        self.send(WorkerEvent::Message(value))
    }

    fn send(&self, event: WorkerEvent) -> SwResult<()> {
        self.tx.send(event).map_err(|_| self.stopped())
    }

    fn stopped(&self) -> ServiceWorkerError {
        ServiceWorkerError::StateError(format!("{} is no longer running", self.worker.id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::storage::CacheStorage;
    use turboscout_test::MockFetcher;
    use serde_json::json;
    use url::Url;

    fn handle() -> (WorkerHandle, Arc<MockFetcher>) {
        let fetcher = Arc::new(MockFetcher::new());
        for (path, body) in [
            ("", "root"),
            ("index.html", "index"),
            ("asset-manifest.json", "{}"),
            ("a.js", "a"),
            ("b.js", "b"),
        ] {
            fetcher.route(&format!("https://scout.example/{}", path), 200, body);
        }

        let mut config = WorkerConfig::for_scope(Url::parse("https://scout.example/").unwrap());
        config.skip_waiting_on_install = false;
        let worker = CacheWorker::new(Arc::new(config), CacheStorage::new(), fetcher.clone());
        (WorkerHost::spawn(Arc::new(worker)), fetcher)
    }

    #[tokio::test]
    async fn test_install_then_activate_through_loop() {
        let (handle, _) = handle();

        let report = handle.install().await.unwrap();
        assert_eq!(report.precached.len(), 3);

        let report = handle.activate().await.unwrap();
        assert!(report.deleted.is_empty());
        assert!(handle.worker().clients_claimed());
    }

    #[tokio::test]
    async fn test_concurrent_fetches() {
        let (handle, fetcher) = handle();
        handle.install().await.unwrap();
        handle.worker().restore_active();

        let a = Url::parse("https://scout.example/a.js").unwrap();
        let b = Url::parse("https://scout.example/b.js").unwrap();
        let (ra, rb) = tokio::join!(
            handle.fetch(Request::get(a.clone())),
            handle.fetch(Request::get(b.clone()))
        );
        assert_eq!(ra.unwrap().response.body.as_ref(), b"a");
        assert_eq!(rb.unwrap().response.body.as_ref(), b"b");
        assert_eq!(fetcher.request_count(a.as_str()), 1);
    }

    #[tokio::test]
    async fn test_messages_are_delivered() {
        let (handle, _) = handle();
        handle.post_message(json!({ "type": "SKIP_WAITING" })).unwrap();
        handle.worker().skip_waiting_signal().await;
        assert_eq!(handle.worker().messages_received(), 1);
    }

    #[tokio::test]
    async fn test_posts_without_type_are_dropped() {
        let (handle, _) = handle();
        handle.post_message(json!("SKIP_WAITING")).unwrap();
        handle.post_message(json!({ "kind": "SKIP_WAITING" })).unwrap();
        handle.post_message(json!({ "type": "CLEAR_CACHE" })).unwrap();

        // Install replies after every earlier event has been handled.
        handle.install().await.unwrap();
        assert_eq!(handle.worker().messages_received(), 1);
        assert!(!handle.worker().skip_waiting_requested());
    }
}
