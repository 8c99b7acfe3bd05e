//! State store errors.
//!
//! Storage faults (redb open/transaction/table/read/write failures and JSON
//! codec failures) are kept apart from the two caller-visible outcomes a
//! store method can report on its own: a missing record and a violated
//! constraint.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open state database: {0}")]
    Open(String),

    #[error("state transaction failed: {0}")]
    Transaction(String),

    #[error("state table unavailable: {0}")]
    Table(String),

    #[error("state read failed: {0}")]
    Read(String),

    #[error("state write failed: {0}")]
    Write(String),

    #[error("cannot encode record: {0}")]
    Encode(String),

    #[error("cannot decode record: {0}")]
    Decode(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Checked inside the write transaction: duplicate names, a second
    /// active operation on a target, a stale policy-state generation, or an
    /// overwrite of a terminal operation.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl StateError {
    /// True for failures of the store itself rather than of the request.
    pub fn is_storage_fault(&self) -> bool {
        !matches!(self, StateError::NotFound(_) | StateError::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_outcomes_are_not_storage_faults() {
        assert!(!StateError::Conflict("policy name taken".into()).is_storage_fault());
        assert!(!StateError::NotFound("pool".into()).is_storage_fault());
        assert!(StateError::Decode("expected value at line 1".into()).is_storage_fault());
    }
}
