//! Exponential backoff
//!
//! The controller's error policy spaces out requeues of a failing key and
//! reopened watches with [`RetryConfig::delay_for_attempt`]; one-shot API
//! calls (listing rules, resolving a watched kind) go through
//! [`retry_with_backoff`].

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff schedule: `initial_delay * factor^(attempt-1)`, capped at `max_delay`
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub factor: f64,
    /// Give up after this many attempts; `None` retries forever
    pub max_attempts: Option<u32>,
    /// Scale each delay by a random factor in `0.5..1.5`
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            max_attempts: None,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Default schedule, giving up after `attempts` tries
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: Some(attempts.max(1)),
            ..Default::default()
        }
    }

    /// Same schedule with deterministic delays
    pub fn without_jitter(self) -> Self {
        Self {
            jitter: false,
            ..self
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let cap = self.max_delay.as_secs_f64();
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let mut secs = (self.initial_delay.as_secs_f64() * self.factor.powi(exponent)).min(cap);
        if self.jitter {
            secs = (secs * rand::thread_rng().gen_range(0.5..1.5)).min(cap);
        }
        Duration::from_secs_f64(secs)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

/// Run `operation` until it succeeds or the attempt budget is spent,
/// sleeping per `config` between failures.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 1u32;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if config.exhausted(attempt) {
            error!(operation = operation_name, attempt, error = %err, "giving up");
            return Err(err);
        }

        let delay = config.delay_for_attempt(attempt);
        warn!(operation = operation_name, attempt, error = %err, retry_in = ?delay, "attempt failed");
        tokio::time::sleep(delay).await;
        attempt = attempt.saturating_add(1);
    }
}
