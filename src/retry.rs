//! Retry engine with per-operation exponential backoff policies.
//!
//! Each Raft operation (heartbeat, append_entries, install_snapshot,
//! request_vote) registers its own [`RetryPolicy`]; the engine itself is
//! transport-agnostic and drives any async callable that returns a
//! `Result`. Delay growth is `initial * multiplier^(n-1)` capped at
//! `max_delay`, with optional symmetric jitter.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::ConfigError;
use crate::metrics;

/// Exponent cap keeping `multiplier^(n-1)` finite for any attempt count.
const MAX_SAFE_EXPONENT: u32 = 20;

/// Backoff parameters for one named operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the delay used as symmetric jitter, in `[0, 1]`.
    pub jitter_factor: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5000),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
        jitter_factor: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_multiplier,
            jitter_factor,
            max_attempts,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "backoff_multiplier",
                message: format!("must be >= 1.0, got {}", self.backoff_multiplier),
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidValue {
                field: "jitter_factor",
                message: format!("must be within [0, 1], got {}", self.jitter_factor),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroField {
                field: "max_attempts",
            });
        }
        Ok(())
    }

    /// Base delay before retry number `attempt` (1-based), without
    /// jitter: `min(max_delay, initial * multiplier^(attempt-1))`.
    ///
    /// The exponent is capped so a large attempt count cannot overflow
    /// the arithmetic; the result is always capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_SAFE_EXPONENT);
        let factor = self.backoff_multiplier.powi(exponent as i32);
        let delay_ms = (self.initial_delay.as_millis() as f64) * factor;
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// `delay_for_attempt` with jitter drawn from
    /// `[-jitter*delay, +jitter*delay]`.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if self.jitter_factor == 0.0 {
            return base;
        }
        let base_ms = base.as_millis() as f64;
        let spread = base_ms * self.jitter_factor;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis((base_ms + offset).max(0.0) as u64)
    }
}

/// Well-known operation names with their default policies.
fn default_policies() -> HashMap<String, RetryPolicy> {
    let mut policies = HashMap::new();
    policies.insert(
        "heartbeat".to_string(),
        RetryPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(2000),
            2.0,
            0.1,
            3,
        ),
    );
    policies.insert(
        "append_entries".to_string(),
        RetryPolicy::new(
            Duration::from_millis(50),
            Duration::from_millis(1000),
            2.0,
            0.1,
            4,
        ),
    );
    policies.insert(
        "install_snapshot".to_string(),
        RetryPolicy::new(
            Duration::from_millis(200),
            Duration::from_millis(10000),
            2.0,
            0.1,
            6,
        ),
    );
    policies.insert(
        "request_vote".to_string(),
        RetryPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(5000),
            2.0,
            0.1,
            3,
        ),
    );
    policies
}

/// Registry of named policies plus the backoff executor.
pub struct RetryEngine {
    policies: Mutex<HashMap<String, RetryPolicy>>,
    fallback: RetryPolicy,
}

impl RetryEngine {
    /// Engine preloaded with the standard Raft operation policies.
    pub fn new() -> Self {
        Self {
            policies: Mutex::new(default_policies()),
            fallback: RetryPolicy::default(),
        }
    }

    /// Engine with no preloaded policies; unknown operations use
    /// `fallback`.
    pub fn with_fallback(fallback: RetryPolicy) -> Self {
        Self {
            policies: Mutex::new(HashMap::new()),
            fallback,
        }
    }

    /// Register (or replace) the policy for `operation`.
    pub fn register_policy(
        &self,
        operation: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<(), ConfigError> {
        policy.validate()?;
        self.policies.lock().unwrap().insert(operation.into(), policy);
        Ok(())
    }

    /// The policy that would govern `operation`.
    pub fn policy(&self, operation: &str) -> RetryPolicy {
        self.policies
            .lock()
            .unwrap()
            .get(operation)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// Drive `operation` until it succeeds or its policy's attempt
    /// budget is exhausted; the last error is propagated.
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        operation: &str,
        mut f: F,
    ) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let policy = self.policy(operation);

        let mut attempt = 1u32;
        loop {
            metrics::RETRY_ATTEMPTS_TOTAL
                .with_label_values(&[operation])
                .inc();
            match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(err) if attempt >= policy.max_attempts => {
                    warn!(
                        operation,
                        attempts = attempt,
                        error = %err,
                        "Attempt budget exhausted, propagating last error"
                    );
                    return Err(err);
                }
                Err(err) => {
                    let delay = policy.jittered_delay(attempt);
                    debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_are_monotonic_until_the_cap() {
        let policy = RetryPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(5000),
            2.0,
            0.0,
            10,
        );
        // 100, 200, 400, 800, 1600, 3200, 5000, 5000 ...
        let delays: Vec<u64> = (1..=8)
            .map(|n| policy.delay_for_attempt(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 3200, 5000, 5000]);
        for window in delays.windows(2) {
            assert!(window[1] >= window[0]);
        }
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let policy = RetryPolicy::new(
            Duration::from_millis(100),
            Duration::from_secs(30),
            10.0,
            0.0,
            u32::MAX,
        );
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(
            Duration::from_millis(1000),
            Duration::from_millis(5000),
            2.0,
            0.5,
            3,
        );
        for _ in 0..200 {
            let d = policy.jittered_delay(1).as_millis() as i64;
            assert!((500..=1500).contains(&d), "jittered delay {d} out of range");
        }
    }

    #[test]
    fn policy_validation() {
        let mut policy = RetryPolicy::default();
        policy.backoff_multiplier = 0.5;
        assert!(policy.validate().is_err());

        policy.backoff_multiplier = 2.0;
        policy.jitter_factor = 1.5;
        assert!(policy.validate().is_err());

        policy.jitter_factor = 0.0;
        policy.max_attempts = 0;
        assert!(policy.validate().is_err());
    }

    #[tokio::test]
    async fn failing_operation_is_attempted_exactly_max_attempts_times() {
        let engine = RetryEngine::with_fallback(RetryPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(2),
            2.0,
            0.0,
            4,
        ));
        let mut calls = 0u32;
        let result: Result<(), String> = engine
            .execute_with_retry("always_fails", || {
                calls += 1;
                async { Err("nope".to_string()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn success_stops_retrying() {
        let engine = RetryEngine::with_fallback(RetryPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(2),
            2.0,
            0.0,
            5,
        ));
        let mut calls = 0u32;
        let result: Result<u32, String> = engine
            .execute_with_retry("third_time_lucky", || {
                calls += 1;
                let this_call = calls;
                async move {
                    if this_call < 3 {
                        Err("not yet".to_string())
                    } else {
                        Ok(this_call)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn distinct_operations_use_independent_policies() {
        let engine = RetryEngine::new();
        assert_eq!(engine.policy("heartbeat").max_attempts, 3);
        assert_eq!(engine.policy("append_entries").max_attempts, 4);
        assert_eq!(engine.policy("install_snapshot").max_attempts, 6);
        assert_eq!(
            engine.policy("install_snapshot").initial_delay,
            Duration::from_millis(200)
        );
        // Unknown operations fall back to the default policy.
        assert_eq!(engine.policy("mystery"), RetryPolicy::default());
    }
}
