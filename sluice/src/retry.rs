use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipesError;

/// Bounded retry behaviour for state store calls made by the orchestrator.
///
/// The store itself never retries; callers wrap each operation with
/// [`with_retries`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct StoreRetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for StoreRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

impl StoreRetryConfig {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Computes the delay before the next attempt using exponential backoff.
///
/// Formula: delay = min(base_delay * 2^(failed_attempts - 1), max_backoff)
pub fn compute_backoff_delay(failed_attempts: u32, config: &StoreRetryConfig) -> Duration {
    if failed_attempts == 0 {
        return Duration::ZERO;
    }

    let exp = failed_attempts.saturating_sub(1).min(30) as i32;
    let scaled = (config.base_delay_ms as f64) * 2f64.powi(exp);
    let capped = scaled.min(config.max_backoff_ms as f64);

    Duration::from_millis(capped.max(0.0) as u64)
}

/// Run a state store operation, retrying failures with backoff.
///
/// After `max_attempts` failures the last error is surfaced as
/// [`PipesError::StateStore`].
pub async fn with_retries<T, F, Fut>(
    config: &StoreRetryConfig,
    op: &'static str,
    key: &str,
    mut call: F,
) -> Result<T, PipesError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts => {
                let delay = compute_backoff_delay(attempt, config);
                tracing::warn!(
                    op,
                    key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "state store call failed, retrying: {err:#}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                tracing::error!(op, key, attempt, "state store call failed: {err:#}");
                return Err(PipesError::StateStore {
                    op,
                    key: key.to_string(),
                    attempts: attempt,
                    message: format!("{err:#}"),
                });
            }
        }
    }
}
