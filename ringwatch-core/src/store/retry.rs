use std::future::Future;

use tokio::time;
use tracing::{error, warn};

use crate::config::RetryConfig;
use crate::error::StoreError;

/// Runs a store call under a per-call deadline, retrying transient failures
/// with capped exponential backoff.
///
/// # Errors
///
/// Returns the last error once `max_attempts` is exhausted, or immediately for
/// non-transient failures.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    operation: &'static str,
    mut call: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut backoff = config.initial_backoff;
    let mut attempt = 1;

    loop {
        let result = match time::timeout(config.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(config.call_timeout)),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    ?backoff,
                    error = %err,
                    "store call failed, retrying"
                );
                time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.max_backoff);
                attempt += 1;
            }
            Err(err) => {
                if !err.is_transient() {
                    error!(operation, error = %err, "store call failed permanently");
                }
                return Err(err);
            }
        }
    }
}
