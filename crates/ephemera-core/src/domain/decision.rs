//! Decision model: how the system responds to a failure.
//!
//! The classifier is pure: given an error (or a class tagged at the call site) and
//! the number of attempts made so far, it returns the next action without side
//! effects. Executing the decision (sleeping, writing `failed`, running cleanup) is
//! the caller's job.

use std::time::Duration;

use super::errors::{ErrorClass, RunError};
use super::retry::RetryPolicy;
use crate::ports::{BlobError, ComputeError};

/// The next action to take after a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Try the operation again after a delay.
    Retry { delay: Duration, reason: String },

    /// Give up on the run: record `failed` and route to cleanup.
    Escalate { reason: String },

    /// Failure inside cleanup: log it and move on to the next step.
    LogAndContinue { reason: String },
}

/// Maps failures to an [`ErrorClass`] and a response policy.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    retry_policy: RetryPolicy,
}

impl ErrorClassifier {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Intrinsic class of an error raised outside CleanupAgent.
    pub fn classify(&self, err: &RunError) -> ErrorClass {
        match err {
            RunError::Storage(e) => classify_blob(e),
            RunError::Compute(e) => classify_compute(e),
            RunError::Sync { transient, .. } => {
                if *transient {
                    ErrorClass::Retriable
                } else {
                    ErrorClass::Terminal
                }
            }
            RunError::Timeout { .. } => ErrorClass::Retriable,
            RunError::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted => ErrorClass::Retriable,
                _ => ErrorClass::Terminal,
            },
            // exhaustion re-classifies as terminal exactly once
            RunError::RetriesExhausted { .. }
            | RunError::AlreadyActive { .. }
            | RunError::StateNotFound
            | RunError::InvalidState(_)
            | RunError::CorruptState(_)
            | RunError::PriorFailure(_)
            | RunError::InvalidTransition { .. }
            | RunError::RunMismatch { .. }
            | RunError::Preflight(_)
            | RunError::TrainerExit(_)
            | RunError::Trainer(_)
            | RunError::Killed(_)
            | RunError::Config(_)
            | RunError::Json(_) => ErrorClass::Terminal,
        }
    }

    /// Decide what to do after `attempts` attempts ended in a failure of `class`.
    pub fn decide(&self, class: ErrorClass, attempts: u32) -> Decision {
        match class {
            ErrorClass::Retriable if self.retry_policy.allows_another(attempts) => {
                let delay = self.retry_policy.next_delay(attempts);
                Decision::Retry {
                    delay,
                    reason: format!(
                        "Retry attempt {}/{} after {:?}",
                        attempts + 1,
                        self.retry_policy.max_attempts,
                        delay
                    ),
                }
            }
            ErrorClass::Retriable => Decision::Escalate {
                reason: format!(
                    "Max attempts reached: {}/{}",
                    attempts, self.retry_policy.max_attempts
                ),
            },
            ErrorClass::Terminal => Decision::Escalate {
                reason: "terminal failure".to_string(),
            },
            ErrorClass::CleanupError => Decision::LogAndContinue {
                reason: "cleanup step failed".to_string(),
            },
        }
    }

    /// Shorthand for `decide(classify(err), attempts)`.
    pub fn decide_for(&self, err: &RunError, attempts: u32) -> Decision {
        self.decide(self.classify(err), attempts)
    }
}

fn classify_blob(err: &BlobError) -> ErrorClass {
    if err.is_transient() {
        ErrorClass::Retriable
    } else {
        ErrorClass::Terminal
    }
}

fn classify_compute(err: &ComputeError) -> ErrorClass {
    if err.is_transient() {
        ErrorClass::Retriable
    } else {
        ErrorClass::Terminal
    }
}
