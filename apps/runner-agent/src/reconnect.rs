//! Exponential backoff between attempts to reach the master.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Backoff cap.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_initial_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    15_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt `attempt` (1-based), with ±25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = (self.initial_delay_ms as f64 / 1000.0) * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay_ms as f64 / 1000.0);
        let jitter = capped * 0.25;
        let offset = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / 1_000_000_000.0)
            * 2.0
            - 1.0;
        Duration::from_secs_f64((capped + jitter * offset).max(0.05))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay_ms, 250);
        assert_eq!(config.max_delay_ms, 15_000);
        assert!((config.backoff_factor - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn delays_grow_and_cap_within_jitter() {
        let config = ReconnectConfig::default();
        let expected_base = [0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 15.0, 15.0, 15.0];
        for (i, &base) in expected_base.iter().enumerate() {
            let delay = config.delay_for_attempt((i + 1) as u32).as_secs_f64();
            let (lo, hi) = ((base * 0.75f64).max(0.05), base * 1.25);
            assert!(
                delay >= lo - 1e-9 && delay <= hi + 1e-9,
                "attempt {}: {delay}s not in [{lo}, {hi}]",
                i + 1
            );
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let delay = ReconnectConfig::default().delay_for_attempt(u32::MAX);
        assert!(delay <= Duration::from_secs_f64(15.0 * 1.25));
    }
}
