use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Reconnect delay schedule for one connection.
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once `max_attempts` is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.max_attempts {
            if self.attempts >= max {
                return None;
            }
        }
        let unit = rand::thread_rng().gen_range(-1.0..=1.0);
        let delay = delay_for_attempt(&self.config, self.attempts, unit);
        self.attempts = self.attempts.saturating_add(1);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// `min(base * 2^attempt, max)` scaled by `1 + jitter * unit`, where `unit`
/// is in `[-1, 1]`.
pub fn delay_for_attempt(config: &BackoffConfig, attempt: u32, unit: f64) -> Duration {
    let exp = config.base_delay_ms as f64 * 2.0_f64.powi(attempt.min(32) as i32);
    let capped = exp.min(config.max_delay_ms as f64);
    let jitter = capped * config.jitter_factor.clamp(0.0, 1.0) * unit.clamp(-1.0, 1.0);
    Duration::from_millis((capped + jitter).max(0.0) as u64)
}
