//! Error types surfaced at the policy boundaries.

use std::error::Error;

use thiserror::Error;

/// Result type for calls through a circuit breaker.
pub type BreakerResult<T, E> = Result<T, BreakerError<E>>;

/// Result type for calls through a bulkhead.
pub type BulkheadResult<T, E> = Result<T, BulkheadError<E>>;

/// Error returned by [`CircuitBreaker::call`](crate::CircuitBreaker::call).
///
/// The caller's error type is preserved verbatim; the breaker only adds the
/// `Open` rejection on top of it.
#[derive(Debug, Error)]
pub enum BreakerError<E>
where
    E: Error + 'static,
{
    /// The circuit is open; the operation was not attempted.
    #[error("circuit breaker is open")]
    Open,

    /// The wrapped operation failed.
    #[error("operation error: {0}")]
    Operation(#[source] E),
}

impl<E: Error + 'static> BreakerError<E> {
    /// True when the call was rejected by the breaker rather than failed by
    /// the operation.
    pub fn is_rejection(&self) -> bool {
        matches!(self, BreakerError::Open)
    }
}

/// Error returned by [`Bulkhead::call`](crate::Bulkhead::call).
#[derive(Debug, Error)]
pub enum BulkheadError<E>
where
    E: Error + 'static,
{
    /// Both the in-flight limit and the queue were full.
    #[error("bulkhead queue is full")]
    Rejected,

    /// The wrapped operation failed.
    #[error("operation error: {0}")]
    Operation(#[source] E),
}

impl<E: Error + 'static> BulkheadError<E> {
    /// True when the call was rejected at admission rather than failed by the
    /// operation.
    pub fn is_rejection(&self) -> bool {
        matches!(self, BulkheadError::Rejected)
    }
}

/// Invalid construction parameters for a policy or histogram.
#[derive(Debug, Error)]
#[error("invalid configuration: {message}")]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}
