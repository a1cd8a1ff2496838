//! Backoff policies for spacing health check attempts.

use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default delay between health check attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Default jitter applied to the retry interval.
pub const DEFAULT_JITTER_RATE: f64 = 0.2;

/// Computes the delay before the next attempt.
///
/// The result is signed: a negative delay is a broken policy and is rejected
/// by its callers rather than clamped.
pub trait Backoff: Send + Sync + fmt::Debug {
    /// Delay in milliseconds before attempt number `attempt` (1-based).
    fn next_delay_millis(&self, attempt: u32) -> i64;
}

impl dyn Backoff {
    /// A backoff that always waits `delay_millis`.
    pub fn fixed(delay_millis: i64) -> Arc<dyn Backoff> {
        Arc::new(FixedBackoff { delay_millis })
    }

    /// A backoff doubling from `base_millis` up to `max_millis`.
    pub fn exponential(base_millis: i64, max_millis: i64) -> Arc<dyn Backoff> {
        Arc::new(ExponentialBackoff {
            base_millis,
            max_millis,
        })
    }

    /// The backoff used when none is configured: 3 seconds with 20% jitter.
    pub fn default_health_check() -> Arc<dyn Backoff> {
        Self::retry_interval(DEFAULT_RETRY_INTERVAL)
    }

    /// A fixed interval with the default jitter.
    pub fn retry_interval(interval: Duration) -> Arc<dyn Backoff> {
        let millis = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
        with_jitter(Self::fixed(millis), DEFAULT_JITTER_RATE)
    }
}

/// Wrap a backoff so each delay varies by up to `rate` in either direction.
///
/// `rate` is clamped to `0.0..=1.0`.
pub fn with_jitter(inner: Arc<dyn Backoff>, rate: f64) -> Arc<dyn Backoff> {
    let rate = if rate.is_finite() { rate.clamp(0.0, 1.0) } else { 0.0 };
    Arc::new(JitterBackoff { inner, rate })
}

#[derive(Debug)]
struct FixedBackoff {
    delay_millis: i64,
}

impl Backoff for FixedBackoff {
    fn next_delay_millis(&self, _attempt: u32) -> i64 {
        self.delay_millis
    }
}

#[derive(Debug)]
struct ExponentialBackoff {
    base_millis: i64,
    max_millis: i64,
}

impl Backoff for ExponentialBackoff {
    fn next_delay_millis(&self, attempt: u32) -> i64 {
        if attempt == 0 {
            return 0;
        }
        let factor = 2i64.saturating_pow(attempt - 1);
        self.base_millis.saturating_mul(factor).min(self.max_millis)
    }
}

#[derive(Debug)]
struct JitterBackoff {
    inner: Arc<dyn Backoff>,
    rate: f64,
}

impl Backoff for JitterBackoff {
    fn next_delay_millis(&self, attempt: u32) -> i64 {
        let delay = self.inner.next_delay_millis(attempt);
        // Negative delays pass through untouched so callers can reject them
        if delay <= 0 || self.rate == 0.0 {
            return delay;
        }

        let spread = (delay as f64 * self.rate) as i64;
        if spread == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        delay.saturating_add(jitter).max(0)
    }
}
