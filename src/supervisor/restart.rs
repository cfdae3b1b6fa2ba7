//! Restart backoff calculation and per-service attempt counters.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::SupervisorConfig;

/// Exponential backoff: `delay(n) = min(base * 2^n, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl RestartPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_backoff_delay_ms),
            Duration::from_millis(config.max_backoff_delay_ms),
            config.max_restart_attempts,
        )
    }

    /// Delay before restart attempt `attempts` (zero-based).
    pub fn delay(&self, attempts: u32) -> Duration {
        2u32.checked_pow(attempts)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Restart attempts per service. Never persisted.
#[derive(Debug, Default)]
pub struct RestartTracker {
    attempts: Mutex<HashMap<String, u32>>,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> u32 {
        self.lock().get(name).copied().unwrap_or(0)
    }

    /// Record one more attempt, returning the count before it.
    pub fn increment(&self, name: &str) -> u32 {
        let mut attempts = self.lock();
        let count = attempts.entry(name.to_string()).or_insert(0);
        let previous = *count;
        *count = count.saturating_add(1);
        previous
    }

    pub fn reset(&self, name: &str) {
        self.lock().insert(name.to_string(), 0);
    }

    pub fn reset_all(&self) {
        self.lock().values_mut().for_each(|n| *n = 0);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner())
    }
}
