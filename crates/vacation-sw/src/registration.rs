//! The host side: one registration per scope, holding the installing,
//! waiting and active worker generations.

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStore;
use crate::config::WorkerConfig;
use crate::error::ServiceWorkerError;
use crate::messaging::{Clients, Heartbeat, PageEndpoint};
use crate::network::Network;
use crate::request::{FetchRequest, FetchResponse};
use crate::worker::{ActivationReport, ServiceWorker};

/// Versions in each slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationStatus {
    pub installing: Option<String>,
    pub waiting: Option<String>,
    pub active: Option<String>,
}

/// The active worker and the tasks running on its behalf.
struct ActiveWorker {
    worker: Arc<ServiceWorker>,
    _heartbeat: Heartbeat,
    inbox: Option<JoinHandle<()>>,
}

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        if let Some(task) = self.inbox.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct Slots {
    installing: Option<Arc<ServiceWorker>>,
    waiting: Option<Arc<ServiceWorker>>,
    active: Option<ActiveWorker>,
}

/// A worker registration.
pub struct Registration {
    scope: Url,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
    clients: Arc<Clients>,
    slots: RwLock<Slots>,
}

impl Registration {
    /// Create an empty registration for `scope`.
    pub fn new(scope: Url, store: Arc<dyn CacheStore>, network: Arc<dyn Network>) -> Self {
        Self {
            scope,
            store,
            network,
            clients: Arc::new(Clients::new()),
            slots: RwLock::new(Slots::default()),
        }
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    /// Open pages.
    pub fn clients(&self) -> &Arc<Clients> {
        &self.clients
    }

    /// Install a new worker generation.
    ///
    /// On failure the new generation is discarded and whatever was active
    /// stays in control. On success the worker waits for [`activate`].
    ///
    /// [`activate`]: Registration::activate
    pub async fn update(
        &self,
        config: WorkerConfig,
    ) -> Result<Arc<ServiceWorker>, ServiceWorkerError> {
        if config.scope != self.scope {
            return Err(ServiceWorkerError::Config(format!(
                "worker scope {} does not match registration scope {}",
                config.scope, self.scope
            )));
        }

        let worker = Arc::new(ServiceWorker::new(
            config,
            Arc::clone(&self.store),
            Arc::clone(&self.network),
            Arc::clone(&self.clients),
        )?);
        info!(scope = %self.scope, version = worker.version(), "Update found");

        self.slots.write().await.installing = Some(Arc::clone(&worker));
        let installed = worker.install().await;

        let mut slots = self.slots.write().await;
        if slots
            .installing
            .as_ref()
            .is_some_and(|w| Arc::ptr_eq(w, &worker))
        {
            slots.installing = None;
        }

        if let Err(err) = installed {
            warn!(
                version = worker.version(),
                active = ?slots.active.as_ref().map(|a| a.worker.version()),
                error = %err,
                "New worker discarded"
            );
            return Err(err);
        }

        if let Some(replaced) = slots.waiting.replace(Arc::clone(&worker)) {
            debug!(version = replaced.version(), "Waiting worker replaced");
            replaced.mark_redundant().await;
        }
        Ok(worker)
    }

    /// Promote the waiting worker.
    ///
    /// Fetches are held back until activation finishes, then routed to the
    /// new generation.
    pub async fn activate(&self) -> Result<ActivationReport, ServiceWorkerError> {
        let mut slots = self.slots.write().await;
        let worker = slots
            .waiting
            .take()
            .ok_or_else(|| ServiceWorkerError::NotFound("no waiting worker".into()))?;

        let report = match worker.activate().await {
            Ok(report) => report,
            Err(err) => {
                worker.mark_redundant().await;
                return Err(err);
            }
        };

        if let Some(previous) = slots.active.take() {
            info!(version = previous.worker.version(), "Previous worker redundant");
            previous.worker.mark_redundant().await;
        }

        let heartbeat = worker.start_heartbeat();
        let inbox = worker.serve_messages().await;
        slots.active = Some(ActiveWorker {
            worker,
            _heartbeat: heartbeat,
            inbox,
        });
        Ok(report)
    }

    /// Install and activate in one step.
    pub async fn deploy(
        &self,
        config: WorkerConfig,
    ) -> Result<ActivationReport, ServiceWorkerError> {
        self.update(config).await?;
        self.activate().await
    }

    /// Route a request through the active worker, or straight to the
    /// network when nothing is active.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, ServiceWorkerError> {
        let active = self.active_worker().await;
        match active {
            Some(worker) => worker.handle_fetch(request).await,
            None => {
                debug!(url = %request.url, "Uncontrolled fetch");
                Ok(self.network.fetch(&request).await?)
            }
        }
    }

    /// Open a page in this scope. It is controlled right away when a
    /// worker is active.
    pub async fn connect(&self, url: Url) -> PageEndpoint {
        let controller = self.active_worker().await.map(|w| w.controller());
        self.clients.connect(url, controller).await
    }

    pub async fn active_worker(&self) -> Option<Arc<ServiceWorker>> {
        self.slots
            .read()
            .await
            .active
            .as_ref()
            .map(|a| Arc::clone(&a.worker))
    }

    pub async fn active_version(&self) -> Option<String> {
        self.active_worker()
            .await
            .map(|w| w.version().to_string())
    }

    /// Versions in each slot.
    pub async fn status(&self) -> RegistrationStatus {
        let slots = self.slots.read().await;
        RegistrationStatus {
            installing: slots.installing.as_ref().map(|w| w.version().to_string()),
            waiting: slots.waiting.as_ref().map(|w| w.version().to_string()),
            active: slots.active.as_ref().map(|a| a.worker.version().to_string()),
        }
    }

    /// Retire every worker. Cache generations are left in place.
    pub async fn unregister(&self) {
        let mut slots = self.slots.write().await;
        if let Some(worker) = slots.installing.take() {
            worker.mark_redundant().await;
        }
        if let Some(worker) = slots.waiting.take() {
            worker.mark_redundant().await;
        }
        if let Some(active) = slots.active.take() {
            active.worker.mark_redundant().await;
            self.clients.release(active.worker.id()).await;
        }
        info!(scope = %self.scope, "Unregistered");
    }
}
