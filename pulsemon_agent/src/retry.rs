//! Bounded retry policy: per-attempt outcome classification, the retry state
//! machine, and exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Additional attempts after the first one.
pub const MAX_RETRIES: u32 = 3;

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Classification of one completed HTTP attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 2xx response.
    Success,
    /// 429/500/502/503/504.
    RetryableStatus,
    /// Any other non-2xx status.
    FatalStatus,
    /// Timeout or connection-level failure.
    RetryableTransport,
    /// Request could not be issued at all.
    FatalTransport,
    Cancelled,
}

/// Where the retry loop currently is. `Attempting(n)` is zero-based: the
/// first try is attempt 0, and a run ends after `MAX_RETRIES` extra attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Attempting(u32),
    Backoff(u32),
    Succeeded,
    FailedRetryable,
    FailedFatal,
    Cancelled,
}

impl RetryState {
    /// Drive the machine with the outcome of the current attempt. Terminal
    /// states absorb further outcomes.
    pub fn on_outcome(self, outcome: AttemptOutcome, max_retries: u32) -> RetryState {
        let RetryState::Attempting(attempt) = self else {
            return self;
        };
        match outcome {
            AttemptOutcome::Success => RetryState::Succeeded,
            AttemptOutcome::FatalStatus | AttemptOutcome::FatalTransport => RetryState::FailedFatal,
            AttemptOutcome::Cancelled => RetryState::Cancelled,
            AttemptOutcome::RetryableStatus | AttemptOutcome::RetryableTransport => {
                if attempt >= max_retries {
                    RetryState::FailedRetryable
                } else {
                    RetryState::Backoff(attempt)
                }
            }
        }
    }

    /// Leave `Backoff(n)` for attempt `n + 1`.
    pub fn next_attempt(self) -> RetryState {
        match self {
            RetryState::Backoff(attempt) => RetryState::Attempting(attempt + 1),
            other => other,
        }
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

pub fn classify_status(status: u16) -> AttemptOutcome {
    if (200..300).contains(&status) {
        AttemptOutcome::Success
    } else if is_retryable_status(status) {
        AttemptOutcome::RetryableStatus
    } else {
        AttemptOutcome::FatalStatus
    }
}

/// Delay following attempt `n`: `base * 2^n`, scaled by a jitter factor drawn
/// uniformly from [0.75, 1.25].
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.as_secs_f64() * f64::from(1u32 << attempt.min(16));
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_secs_f64(exp * jitter)
}
