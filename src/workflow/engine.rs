use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use super::definition::{WorkflowState, WorkflowTransition};
use super::execution::{
    Actor, EntityKey, HistoryEntry, TransitionOutcome, TransitionRequest, WorkflowEvent, WorkflowExecution,
};
use super::guards::{GuardContext, GuardRegistry};
use super::store::DefinitionStore;
use crate::audit::{self, AuditAction, AuditRecord, AuditSink};
use crate::coi::{CoiGate, Clearance};
use crate::error::{WorkflowError, WorkflowResult};
use crate::observability::{create_entity_span, engine_metrics, OperationTimer};
use crate::sla::SlaService;
use crate::store::ExecutionStore;
use crate::time_source::TimeSource;

/// Current state pointer together with the state's definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentState {
    pub execution: WorkflowExecution,
    pub state: WorkflowState,
}

pub struct WorkflowEngine {
    definitions: Arc<DefinitionStore>,
    executions: Arc<dyn ExecutionStore>,
    coi: CoiGate,
    sla: Arc<SlaService>,
    guards: GuardRegistry,
    audit: Arc<dyn AuditSink>,
    time: Arc<dyn TimeSource>,
}

impl WorkflowEngine {
    pub fn new(
        definitions: Arc<DefinitionStore>,
        executions: Arc<dyn ExecutionStore>,
        coi: CoiGate,
        sla: Arc<SlaService>,
        guards: GuardRegistry,
        audit: Arc<dyn AuditSink>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            definitions,
            executions,
            coi,
            sla,
            guards,
            audit,
            time,
        }
    }

    pub fn definitions(&self) -> &Arc<DefinitionStore> {
        &self.definitions
    }

    async fn load_execution(&self, key: &EntityKey) -> WorkflowResult<WorkflowExecution> {
        self.executions
            .get_execution(key)
            .await?
            .ok_or_else(|| WorkflowError::not_found("workflow execution", key.to_string()))
    }

    /// Create the execution for a new entity in the initial state of the active definition.
    pub async fn start(
        &self,
        entity_type: &str,
        entity_id: &str,
        organization_id: Option<String>,
        started_by: &Actor,
    ) -> WorkflowResult<WorkflowExecution> {
        let key = EntityKey::new(entity_type, entity_id);
        let definition = self.definitions.get_definition(entity_type).await?;
        let initial = definition
            .initial_state()
            .ok_or_else(|| WorkflowError::InvalidDefinition {
                reason: format!("{} has no initial state", definition.definition_id()),
            })?;

        let now = self.time.now();
        let execution = WorkflowExecution::start(&key, organization_id, &definition, initial, now);
        let execution = self.executions.create_execution(execution).await?;
        self.sla.open_clock(&key, initial).await?;

        info!(
            entity = %key,
            definition = %definition.definition_id(),
            state = %execution.current_state,
            "Workflow execution started"
        );
        let record = AuditRecord::new(
            &started_by.id,
            AuditAction::ExecutionStarted,
            entity_type,
            entity_id,
            now,
        )
        .with_change(None::<&WorkflowExecution>, Some(&execution));
        audit::record(self.audit.as_ref(), record).await;
        Ok(execution)
    }

    /// Outgoing edges the actor could take right now.
    ///
    /// Edges requiring COI clearance are hidden only when the actor has a hard
    /// block; an overridable conflict still surfaces the edge so the caller can
    /// learn an override is possible.
    pub async fn get_available_transitions(
        &self,
        entity_type: &str,
        entity_id: &str,
        actor: &Actor,
    ) -> WorkflowResult<Vec<WorkflowTransition>> {
        let execution = self.load_execution(&EntityKey::new(entity_type, entity_id)).await?;
        let definition = self
            .definitions
            .get_definition_version(entity_type, execution.definition_version)
            .await?;

        let permitted: Vec<WorkflowTransition> = definition
            .outgoing(&execution.current_state)
            .filter(|t| t.allows(&actor.role))
            .cloned()
            .collect();

        let hard_blocked = match &execution.organization_id {
            Some(org) if permitted.iter().any(|t| t.guards.requires_coi_clearance) => {
                self.coi.is_hard_blocked(&actor.id, org).await?
            }
            _ => false,
        };

        Ok(permitted
            .into_iter()
            .filter(|t| !(hard_blocked && t.guards.requires_coi_clearance))
            .collect())
    }

    /// Validate and apply one transition.
    ///
    /// Checks run in a fixed order: observed version, edge, role, conflict of
    /// interest, named guards. The state change and its history row are then
    /// written in one compare-and-swap; losing the race yields `StateConflict`.
    pub async fn execute_transition(
        &self,
        entity_type: &str,
        entity_id: &str,
        request: TransitionRequest,
    ) -> WorkflowResult<TransitionOutcome> {
        let span = create_entity_span("execute_transition", entity_type, entity_id);
        let timer = OperationTimer::new("execute_transition");
        let result = self
            .apply(EntityKey::new(entity_type, entity_id), request)
            .instrument(span)
            .await;
        timer.finish();

        match &result {
            Ok(_) => engine_metrics().record_transition(),
            Err(e) => {
                engine_metrics().record_rejection(e);
                info!(entity_type, entity_id, code = e.code(), error = %e, "Transition rejected");
            }
        }
        result
    }

    async fn apply(&self, key: EntityKey, request: TransitionRequest) -> WorkflowResult<TransitionOutcome> {
        let execution = self.load_execution(&key).await?;
        if let Some(expected) = request.expected_version {
            if expected != execution.version {
                return Err(WorkflowError::StateConflict {
                    entity_type: key.entity_type.clone(),
                    entity_id: key.entity_id.clone(),
                    expected_version: expected,
                    actual_version: execution.version,
                });
            }
        }

        let definition = self
            .definitions
            .get_definition_version(&key.entity_type, execution.definition_version)
            .await?;
        let transition = definition
            .transition(&execution.current_state, &request.transition_code)
            .ok_or_else(|| WorkflowError::InvalidTransition {
                entity_type: key.entity_type.clone(),
                entity_id: key.entity_id.clone(),
                from_state: execution.current_state.clone(),
                transition_code: request.transition_code.clone(),
            })?;

        let performer = &request.performer;
        if !transition.allows(&performer.role) {
            return Err(WorkflowError::Forbidden {
                role: performer.role.to_string(),
                action: format!("perform '{}' from {}", transition.code, execution.current_state),
            });
        }

        let mut metadata = request.metadata.clone();
        if transition.guards.requires_coi_clearance {
            if let Some(org) = &execution.organization_id {
                if let Clearance::Overridden(grant) = self.coi.check_clearance(&performer.id, org, &key.entity_id).await? {
                    info!(override_id = %grant.id, actor_id = %performer.id, "Transition proceeding under COI override");
                    if let serde_json::Value::Object(map) = &mut metadata {
                        map.insert("coi_override_id".to_string(), grant.id.to_string().into());
                    } else if metadata.is_null() {
                        metadata = serde_json::json!({ "coi_override_id": grant.id.to_string() });
                    }
                }
            }
        }

        if !transition.guards.checks.is_empty() {
            let ctx = GuardContext {
                entity_type: key.entity_type.clone(),
                entity_id: key.entity_id.clone(),
                organization_id: execution.organization_id.clone(),
                current_state: execution.current_state.clone(),
                target_state: transition.to_state.clone(),
                transition_code: transition.code.clone(),
                performer: performer.clone(),
                metadata: metadata.clone(),
            };
            self.guards.evaluate(&transition.guards.checks, &ctx).await?;
        }

        let target = definition
            .state(&transition.to_state)
            .ok_or_else(|| WorkflowError::InvalidDefinition {
                reason: format!("{} has no state {}", definition.definition_id(), transition.to_state),
            })?;

        let now = self.time.now();
        let entry = HistoryEntry {
            id: Uuid::new_v4(),
            entity_type: key.entity_type.clone(),
            entity_id: key.entity_id.clone(),
            definition_version: execution.definition_version,
            from_state: execution.current_state.clone(),
            to_state: transition.to_state.clone(),
            transition_code: transition.code.clone(),
            trigger: transition.trigger,
            performed_by: performer.id.clone(),
            comment: request.comment.clone(),
            metadata,
            performed_at: now,
            duration_in_state_secs: (now - execution.updated_at).num_seconds().max(0),
        };
        let updated = self
            .executions
            .apply_transition(&key, execution.version, entry.clone())
            .await?;

        // The state change is committed; clock failures are logged and
        // repaired when the next clock for this entity is opened.
        if let Err(e) = self.sla.close_clock(&key).await {
            warn!(entity = %key, error = %e, "Failed to close SLA clock");
        }
        if !target.is_terminal {
            if let Err(e) = self.sla.open_clock(&key, target).await {
                warn!(entity = %key, state = %target.code, error = %e, "Failed to open SLA clock");
            }
        }

        let record = AuditRecord::new(
            &performer.id,
            AuditAction::TransitionExecuted,
            &key.entity_type,
            &key.entity_id,
            now,
        )
        .with_change(Some(&execution), Some(&updated));
        audit::record(self.audit.as_ref(), record).await;

        info!(
            entity = %key,
            transition = %transition.code,
            from = %entry.from_state,
            to = %entry.to_state,
            performed_by = %performer.id,
            version = updated.version,
            "Transition applied"
        );

        let event = WorkflowEvent {
            entity_type: key.entity_type.clone(),
            entity_id: key.entity_id.clone(),
            organization_id: updated.organization_id.clone(),
            transition_code: transition.code.clone(),
            trigger: transition.trigger,
            from_state: entry.from_state.clone(),
            to_state: entry.to_state.clone(),
            reached_terminal: target.is_terminal,
            performed_by: performer.id.clone(),
            comment: entry.comment.clone(),
            occurred_at: now,
        };
        Ok(TransitionOutcome {
            execution: updated,
            state: target.clone(),
            history_entry: entry,
            event,
        })
    }

    pub async fn get_history(&self, entity_type: &str, entity_id: &str) -> WorkflowResult<Vec<HistoryEntry>> {
        let key = EntityKey::new(entity_type, entity_id);
        self.load_execution(&key).await?;
        self.executions.history(&key).await
    }

    pub async fn get_current_state(&self, entity_type: &str, entity_id: &str) -> WorkflowResult<CurrentState> {
        let execution = self.load_execution(&EntityKey::new(entity_type, entity_id)).await?;
        let definition = self
            .definitions
            .get_definition_version(entity_type, execution.definition_version)
            .await?;
        let state = definition
            .state(&execution.current_state)
            .cloned()
            .ok_or_else(|| WorkflowError::not_found("workflow state", execution.current_state.clone()))?;
        Ok(CurrentState { execution, state })
    }
}
