//! Reusable retry/backoff policy.
//!
//! One policy object, parameterised by attempt count and delays, is shared
//! by connection setup, worker reconnection and history writes.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Exponential backoff with optional jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
    /// Factor applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
    /// Random spread applied to each delay (0.0-1.0).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay_ms: initial_delay.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Builder method to disable jitter (deterministic delays).
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Reject settings that would make delays meaningless.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(format!(
                "jitter_factor must be within 0.0..=1.0, got {}",
                self.jitter_factor
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(format!(
                "backoff_multiplier must be at least 1.0, got {}",
                self.backoff_multiplier
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err("initial_delay_ms exceeds max_delay_ms".to_string());
        }
        Ok(())
    }

    /// Delay to wait after the given failed attempt (1-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }

    /// Delay to wait after the given failed attempt, with jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        if jitter.is_nan() || jitter == 0.0 || base.is_zero() {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-jitter..=jitter);
        base.mul_f64(1.0 + spread)
    }

    /// Run `op` until it succeeds or the attempts are exhausted.
    ///
    /// `op` receives the 1-based attempt number. The last error is returned.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
