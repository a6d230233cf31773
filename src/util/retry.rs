//! Retry with exponential backoff and jitter.
//!
//! Retry belongs to the adapter layer: the agent loop itself never retries a
//! failed provider call. Adapters wrap their transport attempts in a
//! [`RetryPolicy`] so rate limits and transient network failures are
//! absorbed before an error ever reaches the loop.

use std::future::Future;
use std::time::Duration;

use crate::error::CanopyError;

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Initial backoff duration.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Execute an async operation with retry.
    ///
    /// Only errors for which [`CanopyError::is_retryable`] holds are retried.
    /// A server-requested delay (`retry_after_ms`) overrides the computed
    /// backoff for that attempt.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, CanopyError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CanopyError>>,
    {
        let mut backoff = self.initial_backoff;
        let attempts = self.max_attempts.max(1);

        for attempt in 0..attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !e.is_retryable() || attempt + 1 >= attempts {
                        return Err(e);
                    }

                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "retrying after error"
                    );

                    let server_delay = match &e {
                        CanopyError::Provider {
                            retry_after_ms: Some(ms),
                            ..
                        } => Some(Duration::from_millis(*ms)),
                        _ => None,
                    };

                    let sleep_duration = server_delay.unwrap_or_else(|| {
                        // Jitter: 75%–125% of backoff
                        let jitter_factor = 0.75 + (rand_factor() * 0.5);
                        Duration::from_secs_f64(backoff.as_secs_f64() * jitter_factor)
                    });
                    tokio::time::sleep(sleep_duration).await;

                    backoff = Duration::from_secs_f64(
                        (backoff.as_secs_f64() * self.multiplier)
                            .min(self.max_backoff.as_secs_f64()),
                    );
                }
            }
        }

        unreachable!("retry loop returns on the final attempt")
    }
}

/// Simple pseudo-random factor [0, 1) without pulling in the rand crate.
fn rand_factor() -> f64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);

    let hash = hasher.finish();
    (hash % 10000) as f64 / 10000.0
}
