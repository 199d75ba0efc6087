//! Timeout utilities.

use std::future::Future;
use std::time::Duration;

use crate::TrackerError;

/// Run an operation with a timeout.
///
/// With `None` the operation runs unbounded.
pub async fn with_timeout<T, F, Fut>(
    timeout: Option<Duration>,
    operation: F,
) -> Result<T, TrackerError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, operation())
            .await
            .map_err(|_| TrackerError::Timeout(limit)),
        None => Ok(operation().await),
    }
}
