//! Minimum spacing between requests to one provider.

use std::time::Duration;

use litharvest_common::{HarvestError, Result};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::trace;

/// Enforces a minimum gap between consecutive requests to one endpoint group.
///
/// [`acquire`](Self::acquire) returns a permit that must be held while the
/// request is in flight, so requests through one limiter never overlap.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

/// Held for the duration of one outbound request.
#[derive(Debug)]
pub struct RatePermit<'a> {
    _guard: MutexGuard<'a, Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval, last_request: Mutex::new(None) }
    }

    /// `requests_per_second` of 0 disables spacing.
    pub fn per_second(requests_per_second: f64) -> Result<Self> {
        if requests_per_second == 0.0 {
            return Ok(Self::new(Duration::ZERO));
        }
        if requests_per_second.is_nan() || requests_per_second < 0.0 {
            return Err(HarvestError::Config(format!(
                "requests per second must be positive, got {requests_per_second}"
            )));
        }
        Self::from_secs(1.0 / requests_per_second)
    }

    /// Spacing given in (fractional) seconds.
    pub fn from_secs(interval_secs: f64) -> Result<Self> {
        let interval = Duration::try_from_secs_f64(interval_secs).map_err(|e| {
            HarvestError::Config(format!("invalid request interval {interval_secs}s: {e}"))
        })?;
        Ok(Self::new(interval))
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the spacing since the previous request has elapsed, then
    /// record this request as issued.
    pub async fn acquire(&self) -> RatePermit<'_> {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                trace!(wait_ms = wait.as_millis() as u64, "Rate limiter sleeping");
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
        RatePermit { _guard: last }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_first_request_is_immediate() {
        let limiter = RateLimiter::new(Duration::from_secs(3));
        let start = Instant::now();
        drop(limiter.acquire().await);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_requests_are_spaced() {
        let limiter = RateLimiter::new(Duration::from_millis(340));
        let start = Instant::now();
        for _ in 0..4 {
            drop(limiter.acquire().await);
        }
        // Three gaps after the first request.
        assert!(start.elapsed() >= Duration::from_millis(1020));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_wait_when_spacing_already_elapsed() {
        let limiter = RateLimiter::new(Duration::from_millis(100));
        drop(limiter.acquire().await);
        tokio::time::sleep(Duration::from_millis(250)).await;
        let before = Instant::now();
        drop(limiter.acquire().await);
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permit_serializes_requests() {
        let limiter = Arc::new(RateLimiter::new(Duration::ZERO));
        let permit = limiter.acquire().await;

        let l = Arc::clone(&limiter);
        let waiter = tokio::spawn(async move {
            let _p = l.acquire().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        waiter.await.unwrap();
    }

    #[test]
    fn test_per_second() {
        assert_eq!(RateLimiter::per_second(10.0).unwrap().min_interval(), Duration::from_millis(100));
        assert_eq!(RateLimiter::per_second(0.0).unwrap().min_interval(), Duration::ZERO);
    }

    #[test]
    fn test_unusable_rates_are_config_errors() {
        for rps in [-1.0, f64::NAN, 1e-300] {
            assert!(matches!(RateLimiter::per_second(rps), Err(HarvestError::Config(_))), "{rps}");
        }
        for secs in [-0.5, f64::INFINITY, f64::NAN, 1e300] {
            assert!(matches!(RateLimiter::from_secs(secs), Err(HarvestError::Config(_))), "{secs}");
        }
        assert_eq!(RateLimiter::from_secs(0.25).unwrap().min_interval(), Duration::from_millis(250));
    }
}
