//! Node pool error types.

use flowscale_autoscale::{AutoscaleError, ErrorKind};
use flowscale_state::{InvalidTransition, PoolId, StateError};
use thiserror::Error;

/// Errors that can occur during node pool operations.
#[derive(Debug, Error)]
pub enum NodePoolError {
    #[error("node pool not found: {0}")]
    PoolNotFound(PoolId),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// A non-terminal operation already exists for the pool.
    #[error("operation in progress: {0}")]
    OperationInProgress(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("state store error: {0}")]
    State(StateError),
}

impl NodePoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodePoolError::PoolNotFound(_) | NodePoolError::NotFound(_) => ErrorKind::NotFound,
            NodePoolError::Validation(_) => ErrorKind::Validation,
            NodePoolError::Conflict(_)
            | NodePoolError::OperationInProgress(_)
            | NodePoolError::InvalidTransition(_) => ErrorKind::Conflict,
            NodePoolError::Provider(_) => ErrorKind::Provider,
            NodePoolError::Timeout(_) => ErrorKind::Timeout,
            NodePoolError::State(_) => ErrorKind::Internal,
        }
    }
}

impl From<StateError> for NodePoolError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Conflict(msg) => NodePoolError::Conflict(msg),
            StateError::NotFound(msg) => NodePoolError::NotFound(msg),
            other => NodePoolError::State(other),
        }
    }
}

/// Node pool failures seen through the policy engine's scaler seam.
impl From<NodePoolError> for AutoscaleError {
    fn from(err: NodePoolError) -> Self {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::NotFound => AutoscaleError::NotFound(message),
            ErrorKind::Validation => AutoscaleError::Validation(message),
            ErrorKind::Conflict => AutoscaleError::Conflict(message),
            ErrorKind::Timeout => AutoscaleError::Timeout(message),
            _ => AutoscaleError::Provider(message),
        }
    }
}

pub type NodePoolResult<T> = Result<T, NodePoolError>;
