//! Bounded retries with exponential backoff.
//!
//! Every outbound call to a metadata provider goes through [`with_retry`].
//! Only errors the policy's predicate accepts are retried; anything else is
//! returned on the spot without consuming an attempt.

use std::future::Future;
use std::time::Duration;

use litharvest_common::HarvestError;
use rand::Rng;
use tracing::warn;

/// Immutable retry settings, shared by all calls of one client.
pub struct RetryPolicy<E = HarvestError> {
    /// Total attempts, including the first. Treated as at least 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Scale each delay by a uniform factor in [0.5, 1.0].
    pub jitter: bool,
    pub retryable: fn(&E) -> bool,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for RetryPolicy<E> {}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy<HarvestError> {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
            retryable: HarvestError::is_retryable,
        }
    }
}

impl RetryPolicy<HarvestError> {
    /// 0.5s doubling up to 5s.
    pub fn standard() -> Self {
        Self { max_delay: Duration::from_secs(5), ..Self::default() }
    }

    /// 1s doubling up to 10s, for providers that throttle hard.
    pub fn slow() -> Self {
        Self { initial_delay: Duration::from_secs(1), ..Self::default() }
    }

    /// Resolve a preset by name (`default`, `standard`, `slow`).
    pub fn preset(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "default" => Some(Self::default()),
            "standard" => Some(Self::standard()),
            "slow" => Some(Self::slow()),
            _ => None,
        }
    }
}

impl<E> RetryPolicy<E> {
    /// Delay before the retry that follows failed attempt `attempt` (0-based),
    /// before jitter: `min(initial * multiplier^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.backoff_multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial_delay.as_secs_f64() * exp;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    fn sleep_for(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        if self.jitter {
            let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
            base.mul_f64(factor)
        } else {
            base
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up. The last error is returned unchanged.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy<E>, op_name: &str, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !(policy.retryable)(&err) || attempt + 1 >= max_attempts {
                    return Err(err);
                }
                let delay = policy.sleep_for(attempt);
                warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Blocking twin of [`with_retry`] for synchronous call sites.
pub fn with_retry_blocking<T, E, F>(policy: &RetryPolicy<E>, op_name: &str, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Result<T, E>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !(policy.retryable)(&err) || attempt + 1 >= max_attempts {
                    return Err(err);
                }
                let delay = policy.sleep_for(attempt);
                warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retryable failure, backing off"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}
