//! Retrier - ErrorClassifier の Decision を実行するリトライドライバ
//!
//! classifier は純粋関数なので、sleep と timeout はここで行います。
//! tokio の時間を使うため、テストでは `start_paused = true` で待ち時間が消えます。

use std::future::Future;
use std::time::Duration;

use crate::domain::{Decision, ErrorClass, ErrorClassifier, RunError};

/// Runs a failable remote call under a timeout and the retry policy.
#[derive(Debug, Clone, Default)]
pub struct Retrier {
    classifier: ErrorClassifier,
}

impl Retrier {
    pub fn new(classifier: ErrorClassifier) -> Self {
        Self { classifier }
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Call `f` until it succeeds, a terminal error occurs, or the attempt
    /// budget runs out.
    ///
    /// Each attempt is bounded by `timeout`; an elapsed timeout counts as a
    /// retriable failure. Exhaustion is reported once as
    /// [`RunError::RetriesExhausted`], which classifies as terminal.
    pub async fn run<T, E, F, Fut>(&self, op: &str, timeout: Duration, mut f: F) -> Result<T, RunError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<RunError>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let err = match tokio::time::timeout(timeout, f()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e.into(),
                Err(_) => RunError::Timeout {
                    op: op.to_string(),
                    after: timeout,
                },
            };

            let class = self.classifier.classify(&err);
            match self.classifier.decide(class, attempts) {
                Decision::Retry { delay, reason } => {
                    tracing::warn!(op, attempt = attempts, error = %err, "{reason}");
                    tokio::time::sleep(delay).await;
                }
                Decision::Escalate { reason } if class == ErrorClass::Retriable => {
                    tracing::error!(op, attempt = attempts, error = %err, "{reason}");
                    return Err(RunError::RetriesExhausted {
                        op: op.to_string(),
                        attempts,
                        last: Box::new(err),
                    });
                }
                Decision::Escalate { .. } | Decision::LogAndContinue { .. } => return Err(err),
            }
        }
    }
}
