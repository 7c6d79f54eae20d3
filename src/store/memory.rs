//! In-process implementation of every persistence port.
//!
//! Each table sits behind its own tokio lock; operations the ports mark as
//! atomic complete under a single write guard.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{ClockMutation, ClockStore, CoiStore, DefinitionRepository, ExecutionStore, OverrideStore};
use crate::audit::{AuditQuery, AuditRecord, AuditSink};
use crate::coi::{CoiOverride, ReviewerCoi};
use crate::error::{WorkflowError, WorkflowResult};
use crate::sla::SlaClock;
use crate::workflow::{EntityKey, HistoryEntry, WorkflowDefinition, WorkflowExecution};

#[derive(Default)]
struct ExecutionTables {
    executions: HashMap<EntityKey, WorkflowExecution>,
    history: Vec<HistoryEntry>,
}

#[derive(Default)]
pub struct InMemoryStore {
    definitions: RwLock<BTreeMap<(String, u32), WorkflowDefinition>>,
    executions: RwLock<ExecutionTables>,
    cois: RwLock<Vec<ReviewerCoi>>,
    overrides: Mutex<Vec<CoiOverride>>,
    clocks: Mutex<Vec<SlaClock>>,
    audit: RwLock<Vec<AuditRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl DefinitionRepository for InMemoryStore {
    async fn publish_next_version(
        &self,
        mut definition: WorkflowDefinition,
        at: DateTime<Utc>,
    ) -> WorkflowResult<WorkflowDefinition> {
        let mut definitions = self.definitions.write().await;
        let entity_type = definition.entity_type.clone();
        let latest = definitions
            .keys()
            .filter(|(t, _)| *t == entity_type)
            .map(|(_, v)| *v)
            .max()
            .unwrap_or(0);

        for ((t, _), existing) in definitions.iter_mut() {
            if *t == entity_type {
                existing.is_active = false;
            }
        }

        definition.version = latest + 1;
        definition.is_active = true;
        definition.published_at = Some(at);
        definitions.insert((entity_type, definition.version), definition.clone());
        Ok(definition)
    }

    async fn load_definition(&self, entity_type: &str, version: u32) -> WorkflowResult<Option<WorkflowDefinition>> {
        let definitions = self.definitions.read().await;
        Ok(definitions.get(&(entity_type.to_string(), version)).cloned())
    }

    async fn load_active(&self, entity_type: &str) -> WorkflowResult<Option<WorkflowDefinition>> {
        let definitions = self.definitions.read().await;
        Ok(definitions
            .values()
            .find(|d| d.entity_type == entity_type && d.is_active)
            .cloned())
    }

    async fn list_definitions(&self) -> WorkflowResult<Vec<WorkflowDefinition>> {
        Ok(self.definitions.read().await.values().cloned().collect())
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn create_execution(&self, execution: WorkflowExecution) -> WorkflowResult<WorkflowExecution> {
        let mut tables = self.executions.write().await;
        let key = execution.key();
        if let Some(existing) = tables.executions.get(&key) {
            return Err(WorkflowError::StateConflict {
                entity_type: key.entity_type,
                entity_id: key.entity_id,
                expected_version: 0,
                actual_version: existing.version,
            });
        }
        tables.executions.insert(key, execution.clone());
        Ok(execution)
    }

    async fn get_execution(&self, key: &EntityKey) -> WorkflowResult<Option<WorkflowExecution>> {
        Ok(self.executions.read().await.executions.get(key).cloned())
    }

    async fn list_executions(&self, entity_type: Option<&str>) -> WorkflowResult<Vec<WorkflowExecution>> {
        let tables = self.executions.read().await;
        let mut executions: Vec<_> = tables
            .executions
            .values()
            .filter(|e| entity_type.is_none_or(|t| e.entity_type == t))
            .cloned()
            .collect();
        executions.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(executions)
    }

    async fn apply_transition(
        &self,
        key: &EntityKey,
        expected_version: u64,
        entry: HistoryEntry,
    ) -> WorkflowResult<WorkflowExecution> {
        let mut tables = self.executions.write().await;
        let execution = tables
            .executions
            .get_mut(key)
            .ok_or_else(|| WorkflowError::not_found("workflow execution", key.to_string()))?;

        if execution.version != expected_version {
            return Err(WorkflowError::StateConflict {
                entity_type: key.entity_type.clone(),
                entity_id: key.entity_id.clone(),
                expected_version,
                actual_version: execution.version,
            });
        }

        execution.current_state = entry.to_state.clone();
        execution.version += 1;
        execution.updated_at = entry.performed_at;
        let updated = execution.clone();
        tables.history.push(entry);
        Ok(updated)
    }

    async fn history(&self, key: &EntityKey) -> WorkflowResult<Vec<HistoryEntry>> {
        let tables = self.executions.read().await;
        Ok(tables
            .history
            .iter()
            .filter(|h| h.entity_type == key.entity_type && h.entity_id == key.entity_id)
            .cloned()
            .collect())
    }

    async fn all_history(&self, entity_type: Option<&str>) -> WorkflowResult<Vec<HistoryEntry>> {
        let tables = self.executions.read().await;
        Ok(tables
            .history
            .iter()
            .filter(|h| entity_type.is_none_or(|t| h.entity_type == t))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CoiStore for InMemoryStore {
    async fn insert_coi(&self, coi: ReviewerCoi) -> WorkflowResult<ReviewerCoi> {
        self.cois.write().await.push(coi.clone());
        Ok(coi)
    }

    async fn update_coi(&self, coi: ReviewerCoi) -> WorkflowResult<()> {
        let mut cois = self.cois.write().await;
        let slot = cois
            .iter_mut()
            .find(|c| c.id == coi.id)
            .ok_or_else(|| WorkflowError::not_found("conflict of interest", coi.id.to_string()))?;
        *slot = coi;
        Ok(())
    }

    async fn get_coi(&self, id: Uuid) -> WorkflowResult<Option<ReviewerCoi>> {
        Ok(self.cois.read().await.iter().find(|c| c.id == id).cloned())
    }

    async fn cois_for_actor(&self, actor_id: &str) -> WorkflowResult<Vec<ReviewerCoi>> {
        Ok(self
            .cois
            .read()
            .await
            .iter()
            .filter(|c| c.actor_id == actor_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OverrideStore for InMemoryStore {
    async fn insert_override(&self, grant: CoiOverride, now: DateTime<Utc>) -> WorkflowResult<CoiOverride> {
        let mut overrides = self.overrides.lock().await;
        let duplicate = overrides.iter().any(|o| {
            o.is_active_at(now)
                && o.same_scope(&grant.actor_id, &grant.organization_id, grant.entity_id.as_deref())
        });
        if duplicate {
            return Err(WorkflowError::InvalidOverride {
                reason: format!(
                    "an active override already covers {} at {}{}",
                    grant.actor_id,
                    grant.organization_id,
                    grant
                        .entity_id
                        .as_ref()
                        .map(|e| format!(" for entity {e}"))
                        .unwrap_or_default()
                ),
            });
        }
        overrides.push(grant.clone());
        Ok(grant)
    }

    async fn get_override(&self, id: Uuid) -> WorkflowResult<Option<CoiOverride>> {
        Ok(self.overrides.lock().await.iter().find(|o| o.id == id).cloned())
    }

    async fn revoke_override(
        &self,
        id: Uuid,
        reason: &str,
        revoked_by: &str,
        at: DateTime<Utc>,
    ) -> WorkflowResult<CoiOverride> {
        let mut overrides = self.overrides.lock().await;
        let grant = overrides
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or_else(|| WorkflowError::not_found("COI override", id.to_string()))?;
        if grant.revoked_at.is_some() {
            return Err(WorkflowError::InvalidOverride {
                reason: format!("override {id} is already revoked"),
            });
        }
        grant.revoked_at = Some(at);
        grant.revoked_by = Some(revoked_by.to_string());
        grant.revocation_reason = Some(reason.to_string());
        Ok(grant.clone())
    }

    async fn overrides_for(&self, actor_id: &str, organization_id: &str) -> WorkflowResult<Vec<CoiOverride>> {
        Ok(self
            .overrides
            .lock()
            .await
            .iter()
            .filter(|o| o.actor_id == actor_id && o.organization_id == organization_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ClockStore for InMemoryStore {
    async fn insert_clock(&self, clock: SlaClock) -> WorkflowResult<SlaClock> {
        let mut clocks = self.clocks.lock().await;
        if let Some(open) = clocks.iter().find(|c| {
            c.status.is_open() && c.entity_type == clock.entity_type && c.entity_id == clock.entity_id
        }) {
            return Err(WorkflowError::ClockStateError {
                clock_id: open.id.to_string(),
                status: open.status,
                operation: "open a second clock for the same entity",
            });
        }
        clocks.push(clock.clone());
        Ok(clock)
    }

    async fn get_clock(&self, id: Uuid) -> WorkflowResult<Option<SlaClock>> {
        Ok(self.clocks.lock().await.iter().find(|c| c.id == id).cloned())
    }

    async fn modify_clock(&self, id: Uuid, mutation: ClockMutation) -> WorkflowResult<(SlaClock, SlaClock)> {
        let mut clocks = self.clocks.lock().await;
        let clock = clocks
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| WorkflowError::not_found("SLA clock", id.to_string()))?;

        let before = clock.clone();
        let mut working = clock.clone();
        mutation(&mut working)?;
        *clock = working.clone();
        Ok((before, working))
    }

    async fn open_clock_for(&self, key: &EntityKey) -> WorkflowResult<Option<SlaClock>> {
        Ok(self
            .clocks
            .lock()
            .await
            .iter()
            .find(|c| c.status.is_open() && c.entity_type == key.entity_type && c.entity_id == key.entity_id)
            .cloned())
    }

    async fn clocks_for(&self, key: &EntityKey) -> WorkflowResult<Vec<SlaClock>> {
        Ok(self
            .clocks
            .lock()
            .await
            .iter()
            .filter(|c| c.entity_type == key.entity_type && c.entity_id == key.entity_id)
            .cloned()
            .collect())
    }

    async fn all_clocks(&self) -> WorkflowResult<Vec<SlaClock>> {
        Ok(self.clocks.lock().await.clone())
    }
}

#[async_trait]
impl AuditSink for InMemoryStore {
    async fn append(&self, record: AuditRecord) -> WorkflowResult<()> {
        self.audit.write().await.push(record);
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> WorkflowResult<Vec<AuditRecord>> {
        Ok(self
            .audit
            .read()
            .await
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::fixtures::review_definition;
    use crate::workflow::TransitionTrigger;

    fn entry(key: &EntityKey, from: &str, to: &str) -> HistoryEntry {
        HistoryEntry {
            id: Uuid::new_v4(),
            entity_type: key.entity_type.clone(),
            entity_id: key.entity_id.clone(),
            definition_version: 1,
            from_state: from.to_string(),
            to_state: to.to_string(),
            transition_code: "submit".to_string(),
            trigger: TransitionTrigger::User,
            performed_by: "u1".to_string(),
            comment: None,
            metadata: serde_json::Value::Null,
            performed_at: Utc::now(),
            duration_in_state_secs: 0,
        }
    }

    #[tokio::test]
    async fn test_apply_transition_compares_version() {
        let store = InMemoryStore::new();
        let def = review_definition();
        let key = EntityKey::new("REVIEW", "42");
        let execution = WorkflowExecution::start(&key, None, &def, &def.states[0], Utc::now());
        store.create_execution(execution).await.unwrap();

        let updated = store
            .apply_transition(&key, 1, entry(&key, "DRAFT", "SUBMITTED"))
            .await
            .unwrap();
        assert_eq!(updated.current_state, "SUBMITTED");
        assert_eq!(updated.version, 2);

        let stale = store
            .apply_transition(&key, 1, entry(&key, "DRAFT", "SUBMITTED"))
            .await;
        assert!(matches!(
            stale,
            Err(WorkflowError::StateConflict { expected_version: 1, actual_version: 2, .. })
        ));
        assert_eq!(store.history(&key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_execution_is_unique_per_entity() {
        let store = InMemoryStore::new();
        let def = review_definition();
        let key = EntityKey::new("REVIEW", "42");
        let execution = WorkflowExecution::start(&key, None, &def, &def.states[0], Utc::now());

        store.create_execution(execution.clone()).await.unwrap();
        assert!(matches!(
            store.create_execution(execution).await,
            Err(WorkflowError::StateConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_next_version_switches_single_active_version() {
        let store = InMemoryStore::new();
        let v1 = store.publish_next_version(review_definition(), Utc::now()).await.unwrap();
        let mut next = v1.draft_clone();
        next.name = "Peer review v2".to_string();
        next.version = 99;
        let v2 = store.publish_next_version(next, Utc::now()).await.unwrap();

        assert_eq!((v1.version, v2.version), (1, 2));
        let active = store.load_active("REVIEW").await.unwrap().unwrap();
        assert_eq!(active.version, 2);
        assert!(!store.load_definition("REVIEW", 1).await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_concurrent_publishes_get_distinct_versions() {
        let store = std::sync::Arc::new(InMemoryStore::new());
        let publishes = (0..6).map(|_| {
            let store = store.clone();
            async move { store.publish_next_version(review_definition(), Utc::now()).await }
        });
        let mut versions: Vec<u32> = futures::future::join_all(publishes)
            .await
            .into_iter()
            .map(|r| r.unwrap().version)
            .collect();
        versions.sort();

        assert_eq!(versions, vec![1, 2, 3, 4, 5, 6]);
        let active: Vec<_> = store
            .list_definitions()
            .await
            .unwrap()
            .into_iter()
            .filter(|d| d.is_active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].version, 6);
    }
}
