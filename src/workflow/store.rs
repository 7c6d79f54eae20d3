use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::definition::{WorkflowDefinition, WorkflowTransition};
use crate::audit::{self, AuditAction, AuditRecord, AuditSink};
use crate::error::{WorkflowError, WorkflowResult};
use crate::observability::engine_metrics;
use crate::store::DefinitionRepository;
use crate::time_source::TimeSource;

/// Read-mostly access to published workflow definitions.
///
/// Active definitions are cached per entity type and invalidated on publish.
/// Pinned versions never change once published, so they are cached without expiry.
pub struct DefinitionStore {
    repository: Arc<dyn DefinitionRepository>,
    audit: Arc<dyn AuditSink>,
    time: Arc<dyn TimeSource>,
    active: Cache<String, Arc<WorkflowDefinition>>,
    versions: Cache<(String, u32), Arc<WorkflowDefinition>>,
}

impl DefinitionStore {
    pub fn new(
        repository: Arc<dyn DefinitionRepository>,
        audit: Arc<dyn AuditSink>,
        time: Arc<dyn TimeSource>,
        capacity: u64,
        ttl: Duration,
    ) -> Self {
        let active = Cache::builder().max_capacity(capacity).time_to_live(ttl).build();
        let versions = Cache::builder().max_capacity(capacity).build();
        Self {
            repository,
            audit,
            time,
            active,
            versions,
        }
    }

    /// The active definition for an entity type.
    pub async fn get_definition(&self, entity_type: &str) -> WorkflowResult<Arc<WorkflowDefinition>> {
        if let Some(cached) = self.active.get(entity_type).await {
            engine_metrics().record_cache_hit();
            return Ok(cached);
        }
        engine_metrics().record_cache_miss();

        let definition = self
            .repository
            .load_active(entity_type)
            .await?
            .ok_or_else(|| WorkflowError::not_found("active workflow definition", entity_type))?;
        let definition = Arc::new(definition);
        self.active.insert(entity_type.to_string(), definition.clone()).await;
        debug!(definition = %definition.definition_id(), "Cached active definition");
        Ok(definition)
    }

    /// A specific published version; executions stay pinned to the one they started on.
    pub async fn get_definition_version(
        &self,
        entity_type: &str,
        version: u32,
    ) -> WorkflowResult<Arc<WorkflowDefinition>> {
        let key = (entity_type.to_string(), version);
        if let Some(cached) = self.versions.get(&key).await {
            engine_metrics().record_cache_hit();
            return Ok(cached);
        }
        engine_metrics().record_cache_miss();

        let definition = self
            .repository
            .load_definition(entity_type, version)
            .await?
            .ok_or_else(|| WorkflowError::not_found("workflow definition", format!("{entity_type}@{version}")))?;
        let definition = Arc::new(definition);
        self.versions.insert(key, definition.clone()).await;
        Ok(definition)
    }

    pub fn get_transition<'a>(
        definition: &'a WorkflowDefinition,
        from_state: &str,
        transition_code: &str,
    ) -> WorkflowResult<&'a WorkflowTransition> {
        definition
            .transition(from_state, transition_code)
            .ok_or_else(|| {
                WorkflowError::not_found(
                    "transition",
                    format!("{}:{from_state}:{transition_code}", definition.definition_id()),
                )
            })
    }

    /// Validate and publish as the next version, replacing the active one.
    pub async fn publish(
        &self,
        definition: WorkflowDefinition,
        published_by: &str,
    ) -> WorkflowResult<Arc<WorkflowDefinition>> {
        definition.validate()?;
        let now = self.time.now();
        let entity_type = definition.entity_type.clone();

        let definition = self.repository.publish_next_version(definition, now).await?;

        self.active.invalidate(&entity_type).await;

        info!(
            definition = %definition.definition_id(),
            states = definition.states.len(),
            transitions = definition.transitions.len(),
            "Workflow definition published"
        );
        let record = AuditRecord::new(
            published_by,
            AuditAction::DefinitionPublished,
            "WORKFLOW_DEFINITION",
            &definition.definition_id(),
            now,
        )
        .with_change(None::<&WorkflowDefinition>, Some(&definition));
        audit::record(self.audit.as_ref(), record).await;

        Ok(Arc::new(definition))
    }

    /// Inactive editable copy of the active definition.
    pub async fn draft_from_active(&self, entity_type: &str) -> WorkflowResult<WorkflowDefinition> {
        Ok(self.get_definition(entity_type).await?.draft_clone())
    }

    pub async fn list(&self) -> WorkflowResult<Vec<WorkflowDefinition>> {
        self.repository.list_definitions().await
    }
}
