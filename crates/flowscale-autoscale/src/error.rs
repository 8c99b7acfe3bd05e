//! Autoscaler error types.

use flowscale_state::{PolicyId, StateError};
use thiserror::Error;

/// Coarse error category, used by callers to map errors to responses
/// without matching on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Conflict,
    PolicyDisabled,
    AlreadyRunning,
    Provider,
    Timeout,
    Internal,
}

impl ErrorKind {
    /// Provider failures and timeouts may succeed on a later attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Provider | ErrorKind::Timeout)
    }
}

/// Errors that can occur while managing or evaluating scaling policies.
#[derive(Debug, Error)]
pub enum AutoscaleError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("policy is disabled: {0}")]
    PolicyDisabled(PolicyId),

    #[error("policy {policy_id} is already running with {replicas} replicas")]
    AlreadyRunning { policy_id: PolicyId, replicas: u32 },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("metrics unavailable: {0}")]
    Metrics(String),

    #[error("state store error: {0}")]
    State(StateError),
}

impl AutoscaleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AutoscaleError::NotFound(_) => ErrorKind::NotFound,
            AutoscaleError::Validation(_) => ErrorKind::Validation,
            AutoscaleError::Conflict(_) => ErrorKind::Conflict,
            AutoscaleError::PolicyDisabled(_) => ErrorKind::PolicyDisabled,
            AutoscaleError::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            AutoscaleError::Provider(_) | AutoscaleError::Metrics(_) => ErrorKind::Provider,
            AutoscaleError::Timeout(_) => ErrorKind::Timeout,
            AutoscaleError::State(_) => ErrorKind::Internal,
        }
    }
}

impl From<StateError> for AutoscaleError {
    fn from(err: StateError) -> Self {
        // Constraint violations detected inside a store transaction are
        // caller-visible conflicts, not storage faults.
        match err {
            StateError::Conflict(msg) => AutoscaleError::Conflict(msg),
            StateError::NotFound(msg) => AutoscaleError::NotFound(msg),
            other => AutoscaleError::State(other),
        }
    }
}

pub type AutoscaleResult<T> = Result<T, AutoscaleError>;
