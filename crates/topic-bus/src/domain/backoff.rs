//! # Reconnect Backoff
//!
//! Tracks the delay between reconnection attempts: doubled after every
//! scheduled retry, clamped to a maximum, reset to the minimum whenever a
//! connection becomes ready.

use std::time::Duration;

/// Default minimum retry interval (3 seconds).
pub const DEFAULT_MIN_RECONNECT: Duration = Duration::from_millis(3_000);

/// Default maximum retry interval (5 minutes).
pub const DEFAULT_MAX_RECONNECT: Duration = Duration::from_millis(300_000);

/// Exponential backoff state for reconnection scheduling.
///
/// Invariant: `min <= current <= max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectBackoff {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl ReconnectBackoff {
    /// Create a backoff with the given bounds.
    ///
    /// A maximum below the minimum is raised to the minimum.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            current: min,
            min,
            max,
        }
    }

    /// The interval to wait before the next retry.
    #[must_use]
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Return to the minimum interval. Called on every successful
    /// transition to ready.
    pub fn reset(&mut self) {
        self.current = self.min;
    }

    /// Double the interval, clamped at the maximum. Called once per
    /// scheduled retry.
    pub fn grow(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_RECONNECT, DEFAULT_MAX_RECONNECT)
    }
}
