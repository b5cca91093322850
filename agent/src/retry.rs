//! Retry with exponential backoff and jitter
//!
//! Shared by the transport reconnect loop, reliable publishes and the chunk and
//! whole-transfer retries of the transfer service.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::errors::AgentError;
use crate::utils::{calc_exp_backoff, with_jitter, CooldownOptions};

/// Retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `None` retries until success.
    pub max_attempts: Option<u32>,

    /// Delay before the second attempt
    pub base_delay: Duration,

    /// Upper bound for the un-jittered delay
    pub max_delay: Duration,

    /// Growth factor between attempts (1.0 for a fixed delay)
    pub multiplier: f64,

    /// Maximum random delay added on top of each backoff step
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// Fixed delay between a bounded number of attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            base_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: Duration::ZERO,
        }
    }

    /// Exponential backoff capped at `max_delay`
    pub fn exponential(max_attempts: Option<u32>, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            multiplier: 2.0,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after the failed attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let cooldown = CooldownOptions {
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
        };
        with_jitter(calc_exp_backoff(&cooldown, attempt), self.jitter)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

/// Run `op` until it succeeds, the policy is exhausted, or it reports cancellation.
///
/// `op` receives the 0-based attempt number. The last error is returned when the
/// policy runs out of attempts.
pub async fn retry_with_backoff<T, Op, Fut, S, SF>(
    policy: &RetryPolicy,
    sleep_fn: S,
    mut op: Op,
) -> Result<T, AgentError>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
    S: Fn(Duration) -> SF,
    SF: Future<Output = ()>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                attempt += 1;
                if !policy.allows(attempt) {
                    return Err(e);
                }
                let delay = policy.delay_for(attempt - 1);
                debug!("Attempt {} failed ({}), retrying in {:?}", attempt, e, delay);
                sleep_fn(delay).await;
            }
        }
    }
}
