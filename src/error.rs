// Business-rule error taxonomy shared by the engine, COI gate and SLA service.
// Every variant carries enough context for a caller to render a specific message.

use thiserror::Error;

use crate::coi::CoiType;
use crate::sla::ClockStatus;

pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum WorkflowError {
    #[error("Invalid transition: no '{transition_code}' edge from state {from_state} for {entity_type}/{entity_id}")]
    InvalidTransition {
        entity_type: String,
        entity_id: String,
        from_state: String,
        transition_code: String,
    },

    #[error("Forbidden: role {role} may not {action}")]
    Forbidden { role: String, action: String },

    #[error("{}", conflict_message(.actor_id, .organization_id, .overridable))]
    ConflictOfInterest {
        actor_id: String,
        organization_id: String,
        overridable: bool,
        conflicts: Vec<CoiType>,
    },

    #[error("Guard '{guard}' failed: {reason}")]
    GuardFailed { guard: String, reason: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("State conflict on {entity_type}/{entity_id}: expected version {expected_version}, found {actual_version}")]
    StateConflict {
        entity_type: String,
        entity_id: String,
        expected_version: u64,
        actual_version: u64,
    },

    #[error("Invalid override: {reason}")]
    InvalidOverride { reason: String },

    #[error("Clock {clock_id} is {status:?}; cannot {operation}")]
    ClockStateError {
        clock_id: String,
        status: ClockStatus,
        operation: &'static str,
    },

    #[error("Invalid workflow definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("Storage error: {message}")]
    Storage { message: String },
}

fn conflict_message(actor_id: &str, organization_id: &str, overridable: &bool) -> String {
    if *overridable {
        format!(
            "Conflict of interest between {actor_id} and {organization_id}: blocked, override available"
        )
    } else {
        format!(
            "Conflict of interest between {actor_id} and {organization_id}: blocked, cannot be overridden"
        )
    }
}

impl WorkflowError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        WorkflowError::NotFound { kind, id: id.into() }
    }

    pub fn storage(message: impl std::fmt::Display) -> Self {
        WorkflowError::Storage {
            message: message.to_string(),
        }
    }

    /// Only a lost optimistic-concurrency race may be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkflowError::StateConflict { .. })
    }

    /// Stable machine-readable code for the RPC boundary.
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::InvalidTransition { .. } => "INVALID_TRANSITION",
            WorkflowError::Forbidden { .. } => "FORBIDDEN",
            WorkflowError::ConflictOfInterest {
                overridable: true, ..
            } => "CONFLICT_OF_INTEREST_OVERRIDABLE",
            WorkflowError::ConflictOfInterest { .. } => "CONFLICT_OF_INTEREST_HARD_BLOCK",
            WorkflowError::GuardFailed { .. } => "GUARD_FAILED",
            WorkflowError::NotFound { .. } => "NOT_FOUND",
            WorkflowError::StateConflict { .. } => "STATE_CONFLICT",
            WorkflowError::InvalidOverride { .. } => "INVALID_OVERRIDE",
            WorkflowError::ClockStateError { .. } => "CLOCK_STATE_ERROR",
            WorkflowError::InvalidDefinition { .. } => "INVALID_DEFINITION",
            WorkflowError::Storage { .. } => "STORAGE_ERROR",
        }
    }
}
