//! # Reconnect delay policy.
//!
//! The delay for attempt `n` is `first × factor^n`, clamped to `max`.
//! A factor of `1.0` gives a fixed delay.
//!
//! ```rust
//! use std::time::Duration;
//! use warren::ReconnectPolicy;
//!
//! let policy = ReconnectPolicy {
//!     first: Duration::from_millis(100),
//!     max: Duration::from_secs(2),
//!     factor: 2.0,
//! };
//! assert_eq!(policy.next(0), Duration::from_millis(100));
//! assert_eq!(policy.next(1), Duration::from_millis(200));
//! assert_eq!(policy.next(10), Duration::from_secs(2));
//! ```

use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the second connection attempt.
    pub first: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
    /// Multiplicative growth factor.
    pub factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Constant delay between attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            first: delay,
            max: delay,
            factor: 1.0,
        }
    }

    /// Delay after failed attempt number `attempt` (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}
