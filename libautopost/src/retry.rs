//! Failure classification and retry scheduling
//!
//! Deferred retries are never slept on. A failed attempt produces the next
//! stored state of the target: `retrying` with a `next_attempt_at`, or
//! `failed` once the budget is spent.

use std::time::Duration;

use rand::Rng;

use crate::config::DispatcherConfig;
use crate::error::PlatformError;
use crate::types::{FailureClass, Target, TargetStatus};

/// Classify an adapter error
pub fn classify(error: &PlatformError) -> FailureClass {
    match error {
        PlatformError::Network(_)
        | PlatformError::Unavailable(_)
        | PlatformError::RateLimited { .. } => FailureClass::Transient,
        PlatformError::AuthExpired(_) => FailureClass::AuthExpired,
        PlatformError::InvalidMedia(_)
        | PlatformError::Rejected(_)
        | PlatformError::Protocol(_)
        | PlatformError::RefreshDenied(_) => FailureClass::Permanent,
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Transient failures allowed before a target fails for good
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_rate_limit_reschedules: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DispatcherConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_secs(config.base_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
            max_rate_limit_reschedules: config.max_rate_limit_reschedules,
        }
    }

    /// Delay before retrying after the `failures`-th consecutive transient
    /// failure: `min(base * 2^(failures-1) + jitter, max)` with jitter drawn
    /// from `[0, base)`.
    pub fn backoff_delay<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;

        let factor = 1u64
            .checked_shl(failures.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let exponential = base.saturating_mul(factor);
        let jitter = if base > 0 { rng.gen_range(0..base) } else { 0 };

        Duration::from_millis(exponential.saturating_add(jitter).min(max))
    }

    /// Next stored state of a claimed target after `error`.
    ///
    /// An `AuthExpired` reaching this point already survived a forced refresh
    /// and is final.
    pub fn on_failure<R: Rng + ?Sized>(
        &self,
        target: &Target,
        error: &PlatformError,
        now: i64,
        rng: &mut R,
    ) -> Target {
        let message = error.to_string();

        match (classify(error), error) {
            (FailureClass::Transient, PlatformError::RateLimited { retry_after, .. }) => {
                let hits = target.rate_limit_hits + 1;
                if hits > self.max_rate_limit_reschedules {
                    let mut failed = give_up(
                        target,
                        FailureClass::Permanent,
                        format!("Still rate limited after {} reschedules: {}", hits - 1, message),
                    );
                    failed.rate_limit_hits = hits;
                    return failed;
                }

                let wait = retry_after.as_secs().max(1);
                Target {
                    status: TargetStatus::Retrying,
                    rate_limit_hits: hits,
                    next_attempt_at: Some(now.saturating_add(seconds(wait))),
                    last_error: Some(message),
                    failure: Some(FailureClass::Transient),
                    ..target.clone()
                }
            }
            (FailureClass::Transient, _) => {
                let failures = target.transient_failures + 1;
                if failures >= self.max_attempts {
                    let mut failed = give_up(
                        target,
                        FailureClass::Permanent,
                        format!("Gave up after {} transient failures: {}", failures, message),
                    );
                    failed.transient_failures = failures;
                    return failed;
                }

                let delay = self.backoff_delay(failures, rng);
                Target {
                    status: TargetStatus::Retrying,
                    transient_failures: failures,
                    next_attempt_at: Some(now.saturating_add(seconds(ceil_secs(delay)))),
                    last_error: Some(message),
                    failure: Some(FailureClass::Transient),
                    ..target.clone()
                }
            }
            (class, _) => give_up(target, class, message),
        }
    }
}

/// Permanently fail a target with `class` as the recorded cause
pub fn give_up(target: &Target, class: FailureClass, message: String) -> Target {
    Target {
        status: TargetStatus::Failed,
        next_attempt_at: None,
        last_error: Some(message),
        failure: Some(class),
        ..target.clone()
    }
}

fn ceil_secs(delay: Duration) -> u64 {
    let secs = delay.as_secs();
    if delay.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

fn seconds(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}
