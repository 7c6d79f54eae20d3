use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::definition::{Role, TransitionTrigger, WorkflowDefinition, WorkflowState};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// The acting party: taken from the authenticated session, never from a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: impl Into<Role>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
        }
    }

    pub fn system() -> Self {
        Self {
            id: "system".to_string(),
            role: Role::system(),
        }
    }
}

/// Live state pointer for one business entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub entity_type: String,
    pub entity_id: String,
    /// Owning organization, consulted by the COI gate.
    pub organization_id: Option<String>,
    pub definition_version: u32,
    pub current_state: String,
    /// Optimistic-concurrency stamp; bumped on every applied transition.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn start(
        key: &EntityKey,
        organization_id: Option<String>,
        definition: &WorkflowDefinition,
        initial: &WorkflowState,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_type: key.entity_type.clone(),
            entity_id: key.entity_id.clone(),
            organization_id,
            definition_version: definition.version,
            current_state: initial.code.clone(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_type, &self.entity_id)
    }

    pub fn definition_id(&self) -> String {
        format!("{}@{}", self.entity_type, self.definition_version)
    }
}

/// Append-only ledger row, one per applied transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub definition_version: u32,
    pub from_state: String,
    pub to_state: String,
    pub transition_code: String,
    pub trigger: TransitionTrigger,
    pub performed_by: String,
    pub comment: Option<String>,
    pub metadata: serde_json::Value,
    pub performed_at: DateTime<Utc>,
    /// Time spent in `from_state`, computed when the row is written.
    pub duration_in_state_secs: i64,
}

/// Input to `execute_transition`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRequest {
    pub transition_code: String,
    pub performer: Actor,
    pub comment: Option<String>,
    pub metadata: serde_json::Value,
    /// Version the caller last observed; a mismatch fails with `StateConflict`.
    pub expected_version: Option<u64>,
}

impl TransitionRequest {
    pub fn new(transition_code: impl Into<String>, performer: Actor) -> Self {
        Self {
            transition_code: transition_code.into(),
            performer,
            comment: None,
            metadata: serde_json::Value::Null,
            expected_version: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn expecting_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Context for the caller to emit a domain notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub entity_type: String,
    pub entity_id: String,
    pub organization_id: Option<String>,
    pub transition_code: String,
    pub trigger: TransitionTrigger,
    pub from_state: String,
    pub to_state: String,
    pub reached_terminal: bool,
    pub performed_by: String,
    pub comment: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub execution: WorkflowExecution,
    pub state: WorkflowState,
    pub history_entry: HistoryEntry,
    pub event: WorkflowEvent,
}
