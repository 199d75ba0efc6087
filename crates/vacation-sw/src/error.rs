//! Error types for the worker, its cache store and its network.

use std::time::Duration;

use thiserror::Error;
use vacation_common::TrackerError;

use crate::worker::WorkerState;

/// Errors that can occur in worker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerError {
    /// A manifest resource could not be cached; the generation is discarded.
    #[error("Install failed, could not cache {path}: {reason}")]
    InstallResourceUnavailable { path: String, reason: String },

    /// A stale cache generation could not be deleted during activation.
    #[error("Could not delete cache generation {name}: {reason}")]
    CacheDeletionFailure { name: String, reason: String },

    /// A runtime fetch failed and no offline fallback applied.
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Invalid state: expected {expected}, worker is {actual}")]
    InvalidState {
        expected: WorkerState,
        actual: WorkerState,
    },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Errors from a cache store backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Cache generation not found: {0}")]
    GenerationNotFound(String),
}

/// Errors from the network transport.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<CacheError> for ServiceWorkerError {
    fn from(err: CacheError) -> Self {
        ServiceWorkerError::Cache(err.to_string())
    }
}

impl From<NetworkError> for ServiceWorkerError {
    fn from(err: NetworkError) -> Self {
        ServiceWorkerError::NetworkUnavailable(err.to_string())
    }
}

impl From<url::ParseError> for ServiceWorkerError {
    fn from(err: url::ParseError) -> Self {
        ServiceWorkerError::InvalidUrl(err.to_string())
    }
}

impl From<ServiceWorkerError> for TrackerError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::InstallResourceUnavailable { ref path, .. } => {
                let message = format!("manifest resource {path} unavailable");
                TrackerError::install_with_source(message, err)
            }
            ServiceWorkerError::CacheDeletionFailure { .. } | ServiceWorkerError::Cache(_) => {
                TrackerError::cache_with_source("cache store failure", err)
            }
            ServiceWorkerError::NetworkUnavailable(_) => {
                TrackerError::network_with_source("fetch failed", err)
            }
            ServiceWorkerError::InvalidState { .. } => {
                TrackerError::lifecycle_with_source("worker in wrong state", err)
            }
            ServiceWorkerError::InvalidUrl(_) | ServiceWorkerError::Config(_) => {
                TrackerError::config_with_source("invalid worker configuration", err)
            }
            ServiceWorkerError::NotFound(what) => TrackerError::NotFound(what),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_error_maps_to_unavailable() {
        let err: ServiceWorkerError = NetworkError::RequestFailed("offline".into()).into();
        assert_eq!(
            err,
            ServiceWorkerError::NetworkUnavailable("Request failed: offline".into())
        );
    }

    #[test]
    fn test_tracker_error_categories() {
        let install: TrackerError = ServiceWorkerError::InstallResourceUnavailable {
            path: "app.js".into(),
            reason: "HTTP 404".into(),
        }
        .into();
        assert_eq!(install.category(), "install");
        assert!(!install.is_retryable());

        let network: TrackerError = ServiceWorkerError::NetworkUnavailable("down".into()).into();
        assert_eq!(network.category(), "network");
        assert!(network.is_retryable());

        let state: TrackerError = ServiceWorkerError::InvalidState {
            expected: WorkerState::Active,
            actual: WorkerState::Waiting,
        }
        .into();
        assert_eq!(state.category(), "lifecycle");
    }

    #[test]
    fn test_invalid_state_message() {
        let err = ServiceWorkerError::InvalidState {
            expected: WorkerState::Waiting,
            actual: WorkerState::Redundant,
        };
        assert_eq!(
            err.to_string(),
            "Invalid state: expected waiting, worker is redundant"
        );
    }
}
