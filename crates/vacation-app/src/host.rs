//! Hosting the worker for a bounded session: deploy, open the tracker
//! page, exchange messages, retire.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};
use vacation_common::{OptionExt, Result, TrackerError};
use vacation_sw::{CacheStore, Network, Registration, ServiceWorkerError, WorkerConfig};

use crate::page::{ApplicationPage, PageEvent};

/// Action the page sends once it is controlled.
pub const BUTTON_ACTION: &str = "Button clicked";

/// What happened during a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    /// Version that was active.
    pub version: String,
    /// Cache generation the worker served from.
    pub cache_name: String,
    /// URLs stored in that generation when the session ended.
    pub cached: Vec<String>,
    /// Stale generations removed on activation.
    pub deleted: Vec<String>,
    /// `update` broadcasts the page received.
    pub updates: usize,
    /// Acknowledgments the page received.
    pub acks: usize,
}

/// Deploy `config`, open the shell page and keep it connected for `run_for`.
pub async fn run_session(
    config: WorkerConfig,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
    run_for: Duration,
) -> Result<SessionReport> {
    let registration = Registration::new(config.scope.clone(), Arc::clone(&store), network);
    let shell = config.shell_url()?;

    let activation = registration.deploy(config).await?;
    let worker = registration
        .active_worker()
        .await
        .ok_or_not_found("active worker")?;
    info!(
        version = worker.version(),
        deleted = activation.deleted.len(),
        "Worker active"
    );

    let mut page = ApplicationPage::new(registration.connect(shell).await);
    let mut report = SessionReport {
        version: worker.version().to_string(),
        cache_name: worker.cache_name().to_string(),
        deleted: activation.deleted,
        ..Default::default()
    };

    if !page.send_action(BUTTON_ACTION).await {
        warn!(client = %page.id(), "Action not delivered");
    }

    let deadline = Instant::now() + run_for;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, page.next_message()).await {
        match event {
            PageEvent::Update(_) => report.updates += 1,
            PageEvent::Ack(_) => report.acks += 1,
        }
    }

    report.cached = store
        .entries(&report.cache_name)
        .await
        .map_err(ServiceWorkerError::from)?
        .into_iter()
        .map(|key| key.url)
        .collect();

    page.close().await;
    registration.unregister().await;
    info!(
        updates = report.updates,
        acks = report.acks,
        cached = report.cached.len(),
        "Session finished"
    );
    Ok(report)
}

/// Map a failed session to a process exit code.
pub fn exit_code(err: &TrackerError) -> i32 {
    match err {
        TrackerError::InvalidArgument(_) | TrackerError::Config { .. } => 2,
        _ if err.is_retryable() => 75,
        _ => 1,
    }
}
