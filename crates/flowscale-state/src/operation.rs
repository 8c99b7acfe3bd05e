//! Scaling operation state machine.
//!
//! ```text
//! pending ──▶ in_progress ──▶ completed
//!    │             │     └──▶ failed
//!    │             └────────▶ cancelled
//!    └──▶ cancelled
//! ```
//!
//! A pending operation is started before it can finish, even when it
//! fails at dispatch or has nothing to do. Terminal states are final.
//! Every other transition is rejected.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{OperationState, ScalingOperation};

/// A transition the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid operation transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: OperationState,
    pub to: OperationState,
}

impl OperationState {
    /// Completed, failed and cancelled never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
        )
    }
}

impl ScalingOperation {
    /// Move to `next`, stamping `updated_at`.
    pub fn transition_to(
        &mut self,
        next: OperationState,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    /// Transition to `failed` and capture the error message.
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition_to(OperationState::Failed, now)?;
        self.error = Some(message.into());
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }
}
