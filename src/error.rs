/*!
 * Error types for Bulwark
 */

use bulwark_core_resilience::{CallError, ResilienceError};
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OptimizerError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;

/// Kind of primitive held in the coordinator's registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    CircuitBreaker,
    ConnectionPool,
    Cache,
    BatchProcessor,
}

impl std::fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            InstanceKind::CircuitBreaker => "circuit breaker",
            InstanceKind::ConnectionPool => "connection pool",
            InstanceKind::Cache => "cache",
            InstanceKind::BatchProcessor => "batch processor",
        })
    }
}

#[derive(Debug, Error)]
pub enum OptimizerError {
    /// A primitive reported its own condition (exhaustion, timeout, bad config)
    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    /// No instance of this kind is registered under the name
    #[error("no {kind} named '{name}' is registered")]
    UnknownInstance { kind: InstanceKind, name: String },

    /// An instance of this kind is already registered under the name
    #[error("a {kind} named '{name}' is already registered")]
    AlreadyRegistered { kind: InstanceKind, name: String },

    /// Strategy name that cannot be applied
    #[error("invalid optimization strategy: {0}")]
    InvalidStrategy(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl OptimizerError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            OptimizerError::Config(_) | OptimizerError::InvalidStrategy(_) => EXIT_CONFIG,
            OptimizerError::Resilience(ResilienceError::InvalidConfig(_)) => EXIT_CONFIG,
            _ => EXIT_FAILURE,
        }
    }

    /// Check if this error is transient (temporary, worth retrying)
    pub fn is_transient(&self) -> bool {
        match self {
            OptimizerError::Resilience(e) => e.is_transient(),
            OptimizerError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Failure of a call routed through the coordinator
///
/// Either the coordinator could not resolve the named instances, or the breaker-guarded
/// call itself did not succeed (gated open, or the operation's own error).
#[derive(Debug, Error)]
pub enum GuardedCallError<E> {
    #[error(transparent)]
    Registry(#[from] OptimizerError),

    #[error("{0}")]
    Call(CallError<E>),
}

impl<E> From<CallError<E>> for GuardedCallError<E> {
    fn from(e: CallError<E>) -> Self {
        GuardedCallError::Call(e)
    }
}

impl<E> GuardedCallError<E> {
    /// True when the breaker rejected the call without running it
    pub fn is_open(&self) -> bool {
        matches!(self, GuardedCallError::Call(CallError::Open { .. }))
    }

    /// The operation's own error, if it ran and failed
    pub fn downstream(&self) -> Option<&E> {
        match self {
            GuardedCallError::Call(e) => e.downstream(),
            GuardedCallError::Registry(_) => None,
        }
    }

    pub fn into_downstream(self) -> Option<E> {
        match self {
            GuardedCallError::Call(e) => e.into_downstream(),
            GuardedCallError::Registry(_) => None,
        }
    }
}

impl From<toml::de::Error> for OptimizerError {
    fn from(e: toml::de::Error) -> Self {
        OptimizerError::Config(format!("Failed to parse config: {}", e))
    }
}

impl From<toml::ser::Error> for OptimizerError {
    fn from(e: toml::ser::Error) -> Self {
        OptimizerError::Config(format!("Failed to serialize config: {}", e))
    }
}
