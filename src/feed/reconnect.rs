use rand::Rng;
use std::time::Duration;

use crate::config::ReconnectConfig;

/// Why the feed is about to wait before reconnecting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// An established connection was closed or hit a protocol error
    Closed,
    /// Connect, setup or credential-fetch failure
    Error,
}

/// Computes reconnect delays from [`ReconnectConfig`]
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    fn base_delay(&self, reason: RetryReason) -> Duration {
        match reason {
            RetryReason::Closed => Duration::from_millis(self.config.close_delay_ms),
            RetryReason::Error => Duration::from_millis(self.config.error_delay_ms),
        }
    }

    /// Delay before the next attempt
    ///
    /// `failures` counts consecutive failed attempts since the last
    /// successful connect and only matters when backoff is enabled.
    pub fn delay(&self, reason: RetryReason, failures: u32) -> Duration {
        let base = self.base_delay(reason);
        if !self.config.backoff {
            return base;
        }

        let max_ms = self.config.max_delay_ms as f64;
        let exponent = failures.min(32) as i32;
        let grown = base.as_millis() as f64 * self.config.multiplier.max(1.0).powi(exponent);
        let capped = grown.min(max_ms);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::rng().random_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };

        Duration::from_millis((capped * factor).min(max_ms).max(0.0) as u64)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}
