//! Exponential backoff calculator.
//!
//! The queue engine schedules retries from a persisted attempt counter,
//! so the policy is attempt-indexed rather than stateful.

use core::time::Duration;

/// An attempt-indexed exponential backoff policy.
///
/// The delay for attempt `n` (zero-based) is `base * 2^n`, saturating at
/// `max` when a clamp is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Delay clamp; `None` leaves the growth unbounded.
    pub max: Option<Duration>,
}

impl Policy {
    /// Delay to apply after `attempts_made` failed attempts.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts_made).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor);
        match self.max {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}
