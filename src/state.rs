//! Delivery status lifecycle.
//!
//! ```text
//! Scheduled ──▶ Processing ──▶ Success
//!     ▲             │  ├─────▶ Failure    (retry budget exhausted)
//!     │             │  └─────▶ Discarded  (policy violation)
//!   Retry ◀─────────┘
//! ```
//!
//! Every processed attempt appends exactly one [`DeliveryAttempt`] and
//! increments `num_trials`, so the two always agree.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::backoff::{BackoffPolicy, Verdict};
use crate::dispatcher::{DispatchRequest, DispatchResponse};
use crate::error::DispatchError;
use crate::types::{DeliveryAttempt, Dispatchable, EventStatus};

/// Classified result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 2xx response.
    Delivered,

    /// Network failure or non-2xx response. Retryable.
    Failed(String),

    /// Transport policy or target resolution refused the request. Terminal.
    Rejected(String),
}

impl AttemptOutcome {
    pub fn classify(result: &Result<DispatchResponse, DispatchError>) -> Self {
        match result {
            Ok(response) if response.is_success() => AttemptOutcome::Delivered,
            Ok(response) => AttemptOutcome::Failed(format!(
                "endpoint responded with status {}",
                response.status
            )),
            Err(err @ DispatchError::Network { .. }) => AttemptOutcome::Failed(err.to_string()),
            Err(err @ DispatchError::PolicyViolation(_)) => {
                AttemptOutcome::Rejected(err.to_string())
            }
        }
    }
}

/// What the processor must do after persisting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Delivered,
    Retry(Duration),
    Exhausted,
    Discarded,
}

impl Transition {
    pub fn status(&self) -> EventStatus {
        match self {
            Transition::Delivered => EventStatus::Success,
            Transition::Retry(_) => EventStatus::Retry,
            Transition::Exhausted => EventStatus::Failure,
            Transition::Discarded => EventStatus::Discarded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub from: EventStatus,
    pub to: EventStatus,
}

/// Move an entity into `Processing` ahead of a dispatch.
///
/// `Processing` is accepted as a source so a task redelivered after a
/// worker crash can proceed.
pub fn begin_processing<E: Dispatchable>(
    entity: &mut E,
    now: DateTime<Utc>,
) -> Result<(), InvalidTransition> {
    match entity.status() {
        EventStatus::Scheduled | EventStatus::Retry | EventStatus::Processing => {
            entity.set_status(EventStatus::Processing);
            entity.touch(now);
            Ok(())
        }
        from => Err(InvalidTransition {
            from,
            to: EventStatus::Processing,
        }),
    }
}

/// Apply an attempt to the entity and return the resulting transition.
pub fn record_attempt<E: Dispatchable>(
    entity: &mut E,
    attempt: DeliveryAttempt,
    outcome: &AttemptOutcome,
    policy: &BackoffPolicy,
    now: DateTime<Utc>,
) -> Transition {
    let num_trials = entity.metadata().num_trials;
    let retry_limit = entity.metadata().retry_limit;
    let interval = entity.metadata().interval_seconds;

    let transition = match outcome {
        AttemptOutcome::Delivered => Transition::Delivered,
        AttemptOutcome::Rejected(_) => Transition::Discarded,
        AttemptOutcome::Failed(_) => match policy.decide(num_trials, retry_limit, interval) {
            Verdict::Retry(delay) => Transition::Retry(delay),
            Verdict::Terminal => Transition::Exhausted,
        },
    };

    let description = match (outcome, transition) {
        (AttemptOutcome::Delivered, _) => String::new(),
        (AttemptOutcome::Failed(reason), Transition::Exhausted) => {
            format!("retry limit exceeded: {reason}")
        }
        (AttemptOutcome::Failed(reason), _) | (AttemptOutcome::Rejected(reason), _) => {
            reason.clone()
        }
    };

    let metadata = entity.metadata_mut();
    metadata.num_trials = num_trials.saturating_add(1);
    if let Transition::Retry(delay) = transition {
        metadata.next_send_time =
            now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
    }

    entity.push_attempt(attempt);
    entity.set_status(transition.status());
    entity.set_description(description);
    entity.touch(now);
    transition
}

/// Build the attempt record for a dispatch result.
pub fn attempt_record(
    request: &DispatchRequest,
    result: &Result<DispatchResponse, DispatchError>,
    now: DateTime<Utc>,
) -> DeliveryAttempt {
    let mut attempt = DeliveryAttempt {
        uid: uuid::Uuid::new_v4().to_string(),
        url: request.url.clone(),
        method: request.method.to_string(),
        http_status: None,
        response_headers: Default::default(),
        response_data: String::new(),
        truncated: false,
        success: false,
        error: String::new(),
        latency_ms: 0,
        ip_address: None,
        created_at: now,
    };

    match result {
        Ok(response) => {
            attempt.http_status = Some(response.status);
            attempt.response_headers = response.headers.clone();
            attempt.response_data = String::from_utf8_lossy(&response.body).into_owned();
            attempt.truncated = response.truncated;
            attempt.success = response.is_success();
            attempt.latency_ms = millis(response.latency);
            attempt.ip_address = response.remote_addr.map(|a| a.ip().to_string());
            if !attempt.success {
                attempt.error = format!("endpoint responded with status {}", response.status);
            }
        }
        Err(err) => {
            attempt.error = err.to_string();
        }
    }

    attempt
}

/// Attempt record for a request that was refused before dispatch.
pub fn rejected_record(url: &str, reason: &str, now: DateTime<Utc>) -> DeliveryAttempt {
    DeliveryAttempt {
        uid: uuid::Uuid::new_v4().to_string(),
        url: url.to_string(),
        method: "POST".to_string(),
        http_status: None,
        response_headers: Default::default(),
        response_data: String::new(),
        truncated: false,
        success: false,
        error: reason.to_string(),
        latency_ms: 0,
        ip_address: None,
        created_at: now,
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
