//! Reconnect delay policy.

use rand::Rng;
use std::time::Duration;

use crate::config::ConnectionConfig;

/// Exponential backoff with a ceiling and proportional jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.backoff_base(), config.backoff_max(), config.backoff_jitter)
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Delay before retry number `attempt`, jittered by up to ±`jitter` of
    /// the nominal value and never above the ceiling.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter == 0.0 {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        nominal.mul_f64(1.0 + factor).min(self.max)
    }
}
