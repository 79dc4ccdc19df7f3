//! Reconnect delay policy. Pure, so it can be tested without timers.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Reconnect attempts allowed after consecutive abnormal closes before giving up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^attempt + jitter, cap)`, where `jitter_unit` in `[0, 1)` scales up to one `base`.
    ///
    /// Jitter never exceeds `base` and the sum is clamped to `cap`, so delays never shrink from one
    /// attempt to the next, whatever the numbers.
    pub fn delay(&self, attempt: u32, jitter_unit: f64) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let backoff = self.base.saturating_mul(factor);
        let jitter = self.base.mul_f64(jitter_unit.clamp(0.0, 1.0));
        backoff.saturating_add(jitter).min(self.cap)
    }
}

/// Random jitter unit in `[0, 1)` for [`RetryPolicy::delay`].
pub fn jitter_unit() -> f64 {
    rand::thread_rng().gen_range(0.0..1.0)
}
