//! Exponential reconnection backoff

use std::time::Duration;

use crate::config::Config;

/// Retry interval governor for one channel.
///
/// Each failure schedules a retry after the current interval and then
/// multiplies it by `factor`, never exceeding `ceiling`. A successful
/// connection drops it back to `floor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    factor: u32,
    current: Duration,
    failures: u32,
}

impl Backoff {
    /// Create a backoff starting at `floor`
    pub fn new(floor: Duration, ceiling: Duration, factor: u32) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            factor: factor.max(1),
            current: floor,
            failures: 0,
        }
    }

    /// Build from the reconnect settings of a config
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.reconnect_min(),
            config.reconnect_max(),
            config.backoff_factor,
        )
    }

    /// Interval the next retry would wait
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Consecutive failures since the last success
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.failures = self.failures.saturating_add(1);
        self.current = self
            .current
            .checked_mul(self.factor)
            .unwrap_or(self.ceiling)
            .min(self.ceiling);
        delay
    }

    /// Record a success
    pub fn reset(&mut self) {
        self.current = self.floor;
        self.failures = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
