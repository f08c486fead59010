//! Bounded exponential-backoff retry filtered by classified error codes.

use std::{collections::HashSet, future::Future, time::Duration};

use thiserror::Error;

use crate::{cancel::CancelSignal, events::ValidationCode};

/// Classified failure code used to decide whether an error is retryable.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ErrorCode {
    /// Bad or missing configuration or policy.
    Configuration,
    /// Selection found no peer group satisfying the policy.
    NoEligiblePeers,
    /// Endorsers disagreed on the proposal result.
    EndorsementMismatch,
    /// An endorser returned a non-success chaincode status.
    ChaincodeStatus(i32),
    /// An endorsement signature failed verification.
    InvalidEndorsement,
    /// A peer or orderer was unreachable or timed out.
    TransientNetwork,
    /// The ordering service rejected the envelope.
    OrdererRejected,
    /// Commit confirmation did not arrive in time.
    CommitTimeout,
    /// Commit wait was cancelled by the caller.
    CommitCancelled,
    /// The event stream dropped during commit wait.
    ConnectionLost,
    /// The ledger committed the transaction as invalid.
    TxInvalidated(ValidationCode),
    /// The operation was cancelled before completion.
    Cancelled,
    /// Local failure such as encoding or signing.
    Internal,
}

/// Maps an error onto its [`ErrorCode`].
pub trait Classify {
    /// Returns the classified code of this error.
    fn error_code(&self) -> ErrorCode;
}

/// Retry tuning for one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Sleep before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound for any single sleep.
    pub max_backoff: Duration,
    /// Growth factor applied per attempt.
    pub backoff_multiplier: f64,
    /// Codes that allow another attempt.
    pub retryable_codes: HashSet<ErrorCode>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            retryable_codes: default_retryable_codes(),
        }
    }
}

/// Codes retried by [`RetryPolicy::default`].
#[must_use]
pub fn default_retryable_codes() -> HashSet<ErrorCode> {
    HashSet::from([
        ErrorCode::TransientNetwork,
        ErrorCode::ConnectionLost,
        ErrorCode::EndorsementMismatch,
        ErrorCode::TxInvalidated(ValidationCode::MvccReadConflict),
        ErrorCode::TxInvalidated(ValidationCode::PhantomReadConflict),
    ])
}

impl RetryPolicy {
    /// Policy that makes exactly one attempt.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            retryable_codes: HashSet::new(),
            ..Self::default()
        }
    }

    /// Returns a normalized policy with bounded minimums.
    #[must_use]
    pub fn normalized(self) -> Self {
        let backoff_multiplier = if self.backoff_multiplier.is_finite() {
            self.backoff_multiplier.max(1.0)
        } else {
            1.0
        };
        Self {
            max_attempts: self.max_attempts.max(1),
            max_backoff: self.max_backoff.max(self.initial_backoff),
            backoff_multiplier,
            ..self
        }
    }

    /// Adds one retryable code.
    #[must_use]
    pub fn with_retryable(mut self, code: ErrorCode) -> Self {
        let _ = self.retryable_codes.insert(code);
        self
    }

    /// Returns true when `code` allows another attempt.
    #[must_use]
    pub fn is_retryable(&self, code: ErrorCode) -> bool {
        self.retryable_codes.contains(&code)
    }

    /// Sleep taken after failed attempt number `attempt` (1-based).
    ///
    /// Computed as `min(max_backoff, initial_backoff * multiplier^(attempt - 1))`, so it never
    /// decreases from one attempt to the next.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let multiplier = if self.backoff_multiplier.is_finite() {
            self.backoff_multiplier.max(1.0)
        } else {
            1.0
        };
        let cap = self.max_backoff.max(self.initial_backoff);
        let seconds = self.initial_backoff.as_secs_f64() * multiplier.powi(exponent);
        Duration::try_from_secs_f64(seconds)
            .map_or(cap, |backoff| backoff.min(cap))
    }
}

/// Failure returned by the retry invoker, preserving the last underlying error.
#[derive(Debug, Error)]
#[error("operation failed after {attempts} attempt(s): {source}")]
pub struct RetryError<E> {
    /// Attempts made before giving up.
    pub attempts: u32,
    /// Error from the final attempt.
    pub source: E,
}

impl<E> RetryError<E> {
    /// Returns the final attempt's error.
    #[must_use]
    pub const fn cause(&self) -> &E {
        &self.source
    }

    /// Consumes the wrapper and returns the final attempt's error.
    #[must_use]
    pub fn into_cause(self) -> E {
        self.source
    }
}

impl<E: Classify> Classify for RetryError<E> {
    fn error_code(&self) -> ErrorCode {
        self.source.error_code()
    }
}

/// Runs `operation` under `policy`.
///
/// `operation` receives the 1-based attempt number.
///
/// # Errors
///
/// Returns [`RetryError`] carrying the first non-retryable error, or the last error once
/// attempts are exhausted or `cancel` fires during a backoff sleep.
pub async fn invoke<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelSignal,
    operation: F,
) -> Result<T, RetryError<E>>
where
    E: Classify,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    invoke_with_hook(policy, cancel, |_, _, _| {}, operation).await
}

/// Same as [`invoke`] with a hook called before each backoff sleep.
///
/// The hook receives the failed error, the attempt number that failed, and the backoff.
///
/// # Errors
///
/// See [`invoke`].
pub async fn invoke_with_hook<T, E, F, Fut, H>(
    policy: &RetryPolicy,
    cancel: &CancelSignal,
    mut before_retry: H,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    E: Classify,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    H: FnMut(&E, u32, Duration),
{
    let policy = policy.clone().normalized();
    let mut attempt = 0_u32;
    loop {
        attempt = attempt.saturating_add(1);
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        let code = error.error_code();
        if attempt >= policy.max_attempts || !policy.is_retryable(code) {
            return Err(RetryError {
                attempts: attempt,
                source: error,
            });
        }
        let backoff = policy.backoff_for(attempt);
        tracing::info!(
            attempt,
            ?code,
            backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
            "retrying after retryable failure"
        );
        before_retry(&error, attempt, backoff);
        tokio::select! {
            () = cancel.cancelled() => {
                return Err(RetryError {
                    attempts: attempt,
                    source: error,
                });
            }
            () = tokio::time::sleep(backoff) => {}
        }
    }
}
