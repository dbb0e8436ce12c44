//! Error type for orchestrator runs.

use std::fmt;

use thiserror::Error;

use super::OrchestratorState;
use crate::labels::Label;
use crate::operation::{OperationError, OperationKind};

/// Why a run stopped, or why a call was rejected.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A request could not even be scheduled by the backend.
    #[error("{kind} request{} could not be scheduled", ForLabel(.label.as_ref()))]
    InvalidOperation {
        /// Kind of the rejected request.
        kind: OperationKind,
        /// Label the request was issued for.
        label: Option<Label>,
        /// Backend-reported reason.
        #[source]
        source: OperationError,
    },

    /// A scheduled operation completed in the failed state.
    #[error("{kind} operation{} failed", ForLabel(.label.as_ref()))]
    OperationFailed {
        /// Kind of the failed operation.
        kind: OperationKind,
        /// Label the operation was issued for.
        label: Option<Label>,
        /// Backend-reported reason.
        #[source]
        source: OperationError,
    },

    /// An operation succeeded but produced no result value.
    #[error("{kind} operation succeeded without a result")]
    MissingResult {
        /// Kind of the operation.
        kind: OperationKind,
    },

    /// The backend reported the network as unreachable before a stage.
    #[error("network is not reachable")]
    NetworkUnreachable,

    /// A `start_*` call was made outside its required waiting state.
    #[error("{operation} requires state {expected}, but the orchestrator is in {actual}")]
    ContractViolation {
        /// Rejected call.
        operation: &'static str,
        /// State the call requires.
        expected: OrchestratorState,
        /// State at the time of the call.
        actual: OrchestratorState,
    },

    /// `reset` was called while a stage was running.
    #[error("cannot reset while the orchestrator is in {state}")]
    ResetWhileActive {
        /// State at the time of the call.
        state: OrchestratorState,
    },
}

impl OrchestratorError {
    /// True for caller mistakes that leave the orchestrator untouched.
    #[must_use]
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::ContractViolation { .. } | Self::ResetWhileActive { .. }
        )
    }

    /// Underlying backend error, if any.
    #[must_use]
    pub fn operation_error(&self) -> Option<&OperationError> {
        match self {
            Self::InvalidOperation { source, .. } | Self::OperationFailed { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

struct ForLabel<'a>(Option<&'a Label>);

impl fmt::Display for ForLabel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(label) => write!(f, " for label '{label}'"),
            None => Ok(()),
        }
    }
}
