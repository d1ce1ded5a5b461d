//! Error taxonomy shared by the resilience primitives
//!
//! Three families of failure leave this crate:
//! - [`ResilienceError`]: the primitives' own conditions (pool exhaustion, timeouts)
//! - [`CallError`]: the outcome of a breaker-guarded call, which is either a gating
//!   rejection or the wrapped operation's own error passed through untouched
//! - [`BatchError`]: the per-operation outcome of a coalesced batch execution
//!
//! A cache miss is not an error and is expressed as `Option::None`.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Boxed error type returned by caller-supplied batch functions
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors raised by the primitives themselves
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// No connection handle could be handed out without exceeding `max_connections`
    #[error("connection pool '{pool}' exhausted ({active}/{max} active)")]
    PoolExhausted {
        pool: String,
        active: usize,
        max: usize,
    },

    /// The caller-imposed bound on an operation elapsed
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// A handle was released to a pool that never issued it (or already took it back)
    #[error("connection '{id}' is not active in pool '{pool}'")]
    UnknownConnection { pool: String, id: String },

    /// Invalid configuration for a primitive
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ResilienceError {
    /// Whether the condition is expected to clear up on its own (retry later)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ResilienceError::PoolExhausted { .. } | ResilienceError::Timeout(_)
        )
    }
}

/// Outcome of a breaker-guarded call that did not succeed
///
/// The downstream error is carried verbatim; the breaker records it and hands it back.
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The breaker is open and the operation was not attempted
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },

    /// The wrapped operation failed with its own error
    #[error("{0}")]
    Downstream(E),
}

impl<E> CallError<E> {
    /// True when the call was rejected by the breaker without running
    pub fn is_open(&self) -> bool {
        matches!(self, CallError::Open { .. })
    }

    /// The downstream error, if the operation actually ran and failed
    pub fn into_downstream(self) -> Option<E> {
        match self {
            CallError::Open { .. } => None,
            CallError::Downstream(e) => Some(e),
        }
    }

    /// Borrow the downstream error, if any
    pub fn downstream(&self) -> Option<&E> {
        match self {
            CallError::Open { .. } => None,
            CallError::Downstream(e) => Some(e),
        }
    }
}

/// Per-operation failure of a batched execution
///
/// Clonable so one batch failure can be delivered to every member operation.
#[derive(Debug, Clone, Error)]
pub enum BatchError {
    /// The batch function itself failed; every operation in the call receives this
    #[error("batch '{key}' failed: {error}")]
    Failed {
        key: String,
        error: Arc<dyn StdError + Send + Sync + 'static>,
    },

    /// The batch function returned fewer results than it was given payloads
    #[error("batch '{key}' returned no result for position {index}")]
    MissingResult { key: String, index: usize },

    /// The processor was shut down before the operation was submitted
    #[error("batch processor '{processor}' is shut down")]
    Closed { processor: String },

    /// The worker resolving this operation went away before producing a result
    #[error("batch worker dropped the operation before resolving it")]
    Dropped,
}

impl BatchError {
    /// Wrap a batch function error for shared delivery
    pub fn failed(key: impl Into<String>, error: BoxError) -> Self {
        BatchError::Failed {
            key: key.into(),
            error: Arc::from(error),
        }
    }

    /// The batch function's original error, when this is a shared batch failure
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            BatchError::Failed { error, .. } => Some(error.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_open() {
        let err: CallError<std::io::Error> = CallError::Open {
            name: "llm".to_string(),
        };
        assert!(err.is_open());
        assert_eq!(err.to_string(), "circuit breaker 'llm' is open");
        assert!(err.into_downstream().is_none());
    }

    #[test]
    fn test_call_error_passes_downstream_through() {
        let err: CallError<String> = CallError::Downstream("boom".to_string());
        assert!(!err.is_open());
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.into_downstream().as_deref(), Some("boom"));
    }

    #[test]
    fn test_batch_error_shares_cause() {
        let err = BatchError::failed("reads", "backend unavailable".into());
        let copy = err.clone();
        assert_eq!(
            copy.cause().map(|e| e.to_string()),
            Some("backend unavailable".to_string())
        );
        assert!(err.to_string().contains("reads"));
    }

    #[test]
    fn test_transient_classification() {
        let exhausted = ResilienceError::PoolExhausted {
            pool: "p".into(),
            active: 2,
            max: 2,
        };
        assert!(exhausted.is_transient());
        assert!(!ResilienceError::InvalidConfig("x".into()).is_transient());
    }
}
