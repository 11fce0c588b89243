//! Read-modify-write retry on conflicting updates
//!
//! Mirrors client-go's `retry.RetryOnConflict`: the operation is re-run
//! from scratch (including its read) whenever the API server reports a
//! conflict, up to a bounded number of attempts. Any other outcome is
//! returned as-is.

use std::future::Future;

use phasing_core::config::BackoffConfig;
use phasing_core::error::ClusterError;
use phasing_core::ExponentialBackoff;

/// Run `operation` until it stops failing with a conflict.
///
/// Returns `ClusterError::ConflictExhausted` once `config.attempts` attempts
/// have all conflicted.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &BackoffConfig,
    name: &str,
    mut operation: F,
) -> Result<T, ClusterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClusterError>>,
{
    let attempts = config.attempts.max(1);
    let mut backoff = ExponentialBackoff::from_config(config);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Err(ClusterError::Conflict { .. }) if attempt < attempts => {
                let delay = backoff.next_delay();
                tracing::debug!(
                    "Conflict updating Service {} (attempt {}/{}), retrying in {:?}",
                    name,
                    attempt,
                    attempts,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(ClusterError::Conflict { .. }) => {
                tracing::warn!(
                    "Service {} kept changing underneath us, giving up after {} attempts",
                    name,
                    attempts
                );
                return Err(ClusterError::ConflictExhausted {
                    name: name.to_string(),
                    attempts,
                });
            }
            other => return other,
        }
    }
}
