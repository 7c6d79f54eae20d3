// Audit feed - one record per mutating call (actor, action, entity, before/after).
// This is a required sink, separate from tracing output.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{WorkflowError, WorkflowResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ExecutionStarted,
    TransitionExecuted,
    DefinitionPublished,
    CoiDeclared,
    CoiWithdrawn,
    CoiSeverityEscalated,
    CoiSynced,
    OverrideCreated,
    OverrideRevoked,
    ClockPaused,
    ClockResumed,
    ClockExtended,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::ExecutionStarted => "workflow.execution_started",
            AuditAction::TransitionExecuted => "workflow.transition_executed",
            AuditAction::DefinitionPublished => "workflow.definition_published",
            AuditAction::CoiDeclared => "coi.declared",
            AuditAction::CoiWithdrawn => "coi.withdrawn",
            AuditAction::CoiSeverityEscalated => "coi.severity_escalated",
            AuditAction::CoiSynced => "coi.synced",
            AuditAction::OverrideCreated => "coi.override_created",
            AuditAction::OverrideRevoked => "coi.override_revoked",
            AuditAction::ClockPaused => "sla.clock_paused",
            AuditAction::ClockResumed => "sla.clock_resumed",
            AuditAction::ClockExtended => "sla.clock_extended",
        }
    }

    const ALL: [AuditAction; 12] = [
        AuditAction::ExecutionStarted,
        AuditAction::TransitionExecuted,
        AuditAction::DefinitionPublished,
        AuditAction::CoiDeclared,
        AuditAction::CoiWithdrawn,
        AuditAction::CoiSeverityEscalated,
        AuditAction::CoiSynced,
        AuditAction::OverrideCreated,
        AuditAction::OverrideRevoked,
        AuditAction::ClockPaused,
        AuditAction::ClockResumed,
        AuditAction::ClockExtended,
    ];
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditAction::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| WorkflowError::storage(format!("unknown audit action '{s}'")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub actor_id: String,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: String,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        actor_id: &str,
        action: AuditAction,
        entity_type: &str,
        entity_id: &str,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor_id: actor_id.to_string(),
            action,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            before: None,
            after: None,
            recorded_at,
        }
    }

    /// Attach before/after snapshots; serialization failures degrade to `None`.
    pub fn with_change<B: Serialize, A: Serialize>(mut self, before: Option<&B>, after: Option<&A>) -> Self {
        self.before = before.and_then(|b| serde_json::to_value(b).ok());
        self.after = after.and_then(|a| serde_json::to_value(a).ok());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditQuery {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub action: Option<AuditAction>,
}

impl AuditQuery {
    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.entity_type.as_ref().is_none_or(|t| *t == record.entity_type)
            && self.entity_id.as_ref().is_none_or(|i| *i == record.entity_id)
            && self.action.is_none_or(|a| a == record.action)
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: AuditRecord) -> WorkflowResult<()>;

    async fn query(&self, query: &AuditQuery) -> WorkflowResult<Vec<AuditRecord>>;
}

/// Append to the sink and mirror the record into the structured log.
///
/// Callers record after their change has committed, so a failed append is logged
/// and counted rather than returned: the change stands either way.
pub async fn record(sink: &dyn AuditSink, record: AuditRecord) {
    let action = record.action;
    let actor_id = record.actor_id.clone();
    let entity_type = record.entity_type.clone();
    let entity_id = record.entity_id.clone();

    match sink.append(record).await {
        Ok(()) => tracing::info!(
            audit.action = %action,
            audit.actor = %actor_id,
            entity_type = %entity_type,
            entity_id = %entity_id,
            "Audit record appended"
        ),
        Err(e) => {
            crate::observability::engine_metrics().record_audit_failure();
            tracing::warn!(
                audit.action = %action,
                audit.actor = %actor_id,
                entity_type = %entity_type,
                entity_id = %entity_id,
                error = %e,
                "Audit append failed after commit"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_round_trips_through_str() {
        for action in AuditAction::ALL {
            assert_eq!(action.as_str().parse::<AuditAction>().unwrap(), action);
        }
        assert!("coi.unknown".parse::<AuditAction>().is_err());
    }

    #[test]
    fn test_query_filters() {
        let record = AuditRecord::new("admin", AuditAction::OverrideCreated, "ORGANIZATION", "org-1", Utc::now());
        assert!(AuditQuery::default().matches(&record));
        assert!(AuditQuery {
            action: Some(AuditAction::OverrideCreated),
            ..Default::default()
        }
        .matches(&record));
        assert!(!AuditQuery {
            entity_id: Some("org-2".to_string()),
            ..Default::default()
        }
        .matches(&record));
    }
}
