//! Worker generations and their lifecycle.
//!
//! ```text
//! Installing ──install()──► Waiting ──activate()──► Activating ──► Active
//!      │                                                             │
//!      └── install failure ──► Redundant ◄──── replaced / unregister ┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vacation_common::with_timeout;

use crate::cache::CacheStore;
use crate::config::WorkerConfig;
use crate::error::ServiceWorkerError;
use crate::messaging::{self, Clients, Controller, Envelope, Heartbeat, Message};
use crate::network::Network;
use crate::request::{FetchRequest, RequestKey};

/// Unique identifier for a worker generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Populating its cache generation.
    Installing,
    /// Installed, waiting to take over.
    Waiting,
    /// Removing stale generations and claiming pages.
    Activating,
    /// Serving fetches and messages.
    Active,
    /// Install failed, replaced, or unregistered.
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Installing => "installing",
            WorkerState::Waiting => "waiting",
            WorkerState::Activating => "activating",
            WorkerState::Active => "active",
            WorkerState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    /// Stale generations removed.
    pub deleted: Vec<String>,
    /// Stale generations that could not be removed; retried on the next activation.
    pub failed: Vec<String>,
    /// Pages claimed.
    pub claimed: usize,
}

/// One worker generation.
pub struct ServiceWorker {
    id: ServiceWorkerId,
    config: WorkerConfig,
    cache_name: String,
    pub(crate) state: Arc<RwLock<WorkerState>>,
    pub(crate) store: Arc<dyn CacheStore>,
    pub(crate) network: Arc<dyn Network>,
    clients: Arc<Clients>,
    inbox_tx: mpsc::UnboundedSender<Envelope>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
}

impl fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("cache_name", &self.cache_name)
            .finish_non_exhaustive()
    }
}

impl ServiceWorker {
    /// Create a worker generation in the `Installing` state.
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn CacheStore>,
        network: Arc<dyn Network>,
        clients: Arc<Clients>,
    ) -> Result<Self, ServiceWorkerError> {
        config.validate()?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Ok(Self {
            id: ServiceWorkerId::new(),
            cache_name: config.cache_name(),
            config,
            state: Arc::new(RwLock::new(WorkerState::Installing)),
            store,
            network,
            clients,
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
        })
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    /// Name of this generation's cache.
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Current state.
    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    /// Controller handle pages use to reach this worker.
    pub fn controller(&self) -> Controller {
        Controller::new(self.id, self.config.version.clone(), self.inbox_tx.clone())
    }

    pub(crate) async fn expect_state(
        &self,
        expected: WorkerState,
    ) -> Result<(), ServiceWorkerError> {
        let actual = self.state().await;
        if actual == expected {
            Ok(())
        } else {
            Err(ServiceWorkerError::InvalidState { expected, actual })
        }
    }

    async fn transition(
        &self,
        from: WorkerState,
        to: WorkerState,
    ) -> Result<(), ServiceWorkerError> {
        let mut state = self.state.write().await;
        if *state != from {
            return Err(ServiceWorkerError::InvalidState {
                expected: from,
                actual: *state,
            });
        }
        debug!(worker = ?self.id, from = %from, to = %to, "State change");
        *state = to;
        Ok(())
    }

    /// Mark this generation redundant. Idempotent.
    pub async fn mark_redundant(&self) {
        let mut state = self.state.write().await;
        let from = *state;
        if from != WorkerState::Redundant {
            debug!(worker = ?self.id, from = %from, "Worker redundant");
            *state = WorkerState::Redundant;
        }
    }

    // ==================== Install ====================

    /// Populate this generation's cache with every manifest resource.
    ///
    /// Any unavailable resource fails the whole install: the worker becomes
    /// redundant and a generation it created is deleted again.
    pub async fn install(&self) -> Result<(), ServiceWorkerError> {
        self.expect_state(WorkerState::Installing).await?;
        info!(cache = %self.cache_name, resources = self.config.manifest.len(), "Installing");

        // A redeploy of the same version shares its generation with the live worker.
        let existed = match self.store.keys().await {
            Ok(names) => names.contains(&self.cache_name),
            Err(_) => true,
        };

        match self.populate().await {
            Ok(()) => {
                self.transition(WorkerState::Installing, WorkerState::Waiting)
                    .await?;
                info!(cache = %self.cache_name, "Installed");
                Ok(())
            }
            Err(err) => {
                error!(cache = %self.cache_name, error = %err, "Install failed");
                self.mark_redundant().await;
                if !existed {
                    if let Err(cleanup) = self.store.delete(&self.cache_name).await {
                        warn!(
                            cache = %self.cache_name,
                            error = %cleanup,
                            "Could not discard failed generation"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    async fn populate(&self) -> Result<(), ServiceWorkerError> {
        self.store.open(&self.cache_name).await?;

        for path in &self.config.manifest {
            let unavailable = |reason: String| ServiceWorkerError::InstallResourceUnavailable {
                path: path.clone(),
                reason,
            };

            let url = self.config.resolve(path).map_err(|e| unavailable(e.to_string()))?;
            let request = FetchRequest::get(url);
            let timeout = self.config.fetch_timeout();
            let response = with_timeout(timeout, || self.network.fetch(&request))
                .await
                .map_err(|e| unavailable(e.to_string()))?
                .map_err(|e| unavailable(e.to_string()))?;

            if !response.is_ok() {
                return Err(unavailable(format!("HTTP {}", response.status)));
            }

            let key = RequestKey::get(&request.url);
            self.store
                .put(&self.cache_name, key.clone(), response.to_entry(&key))
                .await
                .map_err(|e| unavailable(e.to_string()))?;
            debug!(cache = %self.cache_name, %key, "Cached manifest resource");
        }
        Ok(())
    }

    // ==================== Activate ====================

    /// Delete every other cache generation, then claim all open pages.
    ///
    /// A failed deletion is logged and skipped; it does not block the others.
    pub async fn activate(&self) -> Result<ActivationReport, ServiceWorkerError> {
        self.transition(WorkerState::Waiting, WorkerState::Activating)
            .await?;
        info!(cache = %self.cache_name, "Activating");

        let mut report = ActivationReport::default();

        let names = match self.store.keys().await {
            Ok(names) => names,
            Err(err) => {
                warn!(error = %err, "Could not list cache generations, skipping cleanup");
                Vec::new()
            }
        };

        for name in names.into_iter().filter(|n| *n != self.cache_name) {
            match self.store.delete(&name).await {
                Ok(_) => {
                    info!(cache = %name, "Deleted stale cache generation");
                    report.deleted.push(name);
                }
                Err(err) => {
                    let failure = ServiceWorkerError::CacheDeletionFailure {
                        name: name.clone(),
                        reason: err.to_string(),
                    };
                    warn!(error = %failure, "Continuing activation");
                    report.failed.push(name);
                }
            }
        }

        report.claimed = self.clients.claim(self.controller()).await;

        self.transition(WorkerState::Activating, WorkerState::Active)
            .await?;
        info!(
            cache = %self.cache_name,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            claimed = report.claimed,
            "Activated"
        );
        Ok(report)
    }

    // ==================== Messaging ====================

    /// Handle a message from a page: log it and acknowledge to the sender.
    pub async fn handle_message(&self, envelope: Envelope) -> bool {
        messaging::respond(&self.clients, envelope).await
    }

    /// Send `message` to every page this worker controls.
    pub async fn broadcast(&self, message: &Message) -> usize {
        self.clients.broadcast(self.id, message).await
    }

    /// Start the periodic `update` broadcast.
    pub fn start_heartbeat(&self) -> Heartbeat {
        Heartbeat::spawn(
            Arc::clone(&self.clients),
            self.id,
            self.config.broadcast_interval(),
            Message::update(self.config.update_message.clone()),
        )
    }

    /// Start answering page messages. Only the first call starts a task.
    pub async fn serve_messages(&self) -> Option<JoinHandle<()>> {
        let inbox = self.inbox_rx.lock().await.take()?;
        Some(messaging::spawn_inbox(Arc::clone(&self.clients), inbox))
    }
}
