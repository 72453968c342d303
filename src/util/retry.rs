//! Retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use crate::error::SibylError;

/// Retry policy for upstream calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Backoff base; attempt `n` backs off `base * 2^n` before jitter.
    pub base_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(150),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Execute an async operation, retrying retryable errors (429, 5xx,
    /// transient network) up to `max_retries` times.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, SibylError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SibylError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !e.is_retryable() || attempt >= self.max_retries {
                        return Err(e);
                    }

                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        error = %e,
                        "Retrying after error"
                    );

                    tokio::time::sleep(self.backoff_for(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Backoff for a given attempt: `min(max, 2^attempt * base * jitter)`
    /// with jitter in [0.85, 1.15].
    fn backoff_for(&self, attempt: u32) -> Duration {
        let jitter = 0.85 + rand_factor() * 0.30;
        let raw = self.base_backoff.as_secs_f64() * f64::from(1u32 << attempt.min(20)) * jitter;
        Duration::from_secs_f64(raw.min(self.max_backoff.as_secs_f64()))
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
