//! Retry decisions.
//!
//! `BackoffPolicy::decide` is a pure function of the attempt count, the
//! retry limit and the configured interval. The delay curve itself is a
//! [`Schedule`] so callers can swap it without touching the decision rule.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::types::RetryStrategy;

/// Upper bound for exponential growth.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Maps the number of completed trials to the wait before the next one.
pub trait Schedule: Send + Sync + fmt::Debug {
    fn delay(&self, num_trials: u64, interval_seconds: u64) -> Duration;
}

/// Same wait before every retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearSchedule;

impl Schedule for LinearSchedule {
    fn delay(&self, _num_trials: u64, interval_seconds: u64) -> Duration {
        Duration::from_secs(interval_seconds)
    }
}

/// `interval * 2^num_trials`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialSchedule {
    pub max: Duration,
}

impl Default for ExponentialSchedule {
    fn default() -> Self {
        Self { max: DEFAULT_MAX_BACKOFF }
    }
}

impl Schedule for ExponentialSchedule {
    fn delay(&self, num_trials: u64, interval_seconds: u64) -> Duration {
        let base = interval_seconds.max(1);
        let shift = u32::try_from(num_trials).unwrap_or(u32::MAX).min(63);
        let pow = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let secs = base.saturating_mul(pow);
        Duration::from_secs(secs).min(self.max.max(Duration::from_secs(base)))
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Retry(Duration),
    Terminal,
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    schedule: Arc<dyn Schedule>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Arc::new(LinearSchedule))
    }
}

impl BackoffPolicy {
    pub fn new(schedule: Arc<dyn Schedule>) -> Self {
        Self { schedule }
    }

    /// Policy for the strategy recorded on an entity.
    pub fn for_strategy(strategy: RetryStrategy, max_backoff: Duration) -> Self {
        match strategy {
            RetryStrategy::Linear => Self::new(Arc::new(LinearSchedule)),
            RetryStrategy::Exponential => {
                Self::new(Arc::new(ExponentialSchedule { max: max_backoff }))
            }
        }
    }

    /// Decide what follows a failed attempt.
    ///
    /// `num_trials` is the count *before* the attempt that just failed.
    pub fn decide(&self, num_trials: u64, retry_limit: u64, interval_seconds: u64) -> Verdict {
        if num_trials.saturating_add(1) < retry_limit {
            Verdict::Retry(self.schedule.delay(num_trials, interval_seconds))
        } else {
            Verdict::Terminal
        }
    }
}
