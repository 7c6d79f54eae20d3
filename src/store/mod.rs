// Persistence ports for the engine, COI subsystem and SLA service.
// Implementations must make the marked operations atomic.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::coi::{CoiOverride, ReviewerCoi};
use crate::error::WorkflowResult;
use crate::sla::SlaClock;
use crate::workflow::{EntityKey, HistoryEntry, WorkflowDefinition, WorkflowExecution};

pub use memory::InMemoryStore;

#[async_trait]
pub trait DefinitionRepository: Send + Sync {
    /// Atomically store `definition` as the next version of its entity type and make
    /// it the only active one. Returns the stored definition with its assigned version.
    async fn publish_next_version(
        &self,
        definition: WorkflowDefinition,
        at: DateTime<Utc>,
    ) -> WorkflowResult<WorkflowDefinition>;

    async fn load_definition(&self, entity_type: &str, version: u32) -> WorkflowResult<Option<WorkflowDefinition>>;

    async fn load_active(&self, entity_type: &str) -> WorkflowResult<Option<WorkflowDefinition>>;

    async fn list_definitions(&self) -> WorkflowResult<Vec<WorkflowDefinition>>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Fails with `StateConflict` if an execution already exists for the entity.
    async fn create_execution(&self, execution: WorkflowExecution) -> WorkflowResult<WorkflowExecution>;

    async fn get_execution(&self, key: &EntityKey) -> WorkflowResult<Option<WorkflowExecution>>;

    async fn list_executions(&self, entity_type: Option<&str>) -> WorkflowResult<Vec<WorkflowExecution>>;

    /// Atomic compare-and-swap: move to `entry.to_state` only if the stored version
    /// still equals `expected_version`, appending `entry` in the same step.
    async fn apply_transition(
        &self,
        key: &EntityKey,
        expected_version: u64,
        entry: HistoryEntry,
    ) -> WorkflowResult<WorkflowExecution>;

    /// Entries for one entity, oldest first.
    async fn history(&self, key: &EntityKey) -> WorkflowResult<Vec<HistoryEntry>>;

    async fn all_history(&self, entity_type: Option<&str>) -> WorkflowResult<Vec<HistoryEntry>>;
}

#[async_trait]
pub trait CoiStore: Send + Sync {
    async fn insert_coi(&self, coi: ReviewerCoi) -> WorkflowResult<ReviewerCoi>;

    async fn update_coi(&self, coi: ReviewerCoi) -> WorkflowResult<()>;

    async fn get_coi(&self, id: Uuid) -> WorkflowResult<Option<ReviewerCoi>>;

    /// Every record for the actor, including end-dated ones.
    async fn cois_for_actor(&self, actor_id: &str) -> WorkflowResult<Vec<ReviewerCoi>>;
}

#[async_trait]
pub trait OverrideStore: Send + Sync {
    /// Insert unless an override active at `now` already covers the same
    /// (actor, organization, entity-or-null) scope; that case is `InvalidOverride`.
    async fn insert_override(&self, grant: CoiOverride, now: DateTime<Utc>) -> WorkflowResult<CoiOverride>;

    async fn get_override(&self, id: Uuid) -> WorkflowResult<Option<CoiOverride>>;

    /// Atomically set revocation fields; fails with `InvalidOverride` if already revoked.
    async fn revoke_override(
        &self,
        id: Uuid,
        reason: &str,
        revoked_by: &str,
        at: DateTime<Utc>,
    ) -> WorkflowResult<CoiOverride>;

    async fn overrides_for(&self, actor_id: &str, organization_id: &str) -> WorkflowResult<Vec<CoiOverride>>;
}

/// Mutation applied to a clock under the store's lock.
pub type ClockMutation = Box<dyn FnOnce(&mut SlaClock) -> WorkflowResult<()> + Send>;

#[async_trait]
pub trait ClockStore: Send + Sync {
    /// Fails with `ClockStateError` if the entity already has an open clock.
    async fn insert_clock(&self, clock: SlaClock) -> WorkflowResult<SlaClock>;

    async fn get_clock(&self, id: Uuid) -> WorkflowResult<Option<SlaClock>>;

    /// Apply `mutation` atomically and return (before, after).
    async fn modify_clock(&self, id: Uuid, mutation: ClockMutation) -> WorkflowResult<(SlaClock, SlaClock)>;

    /// The RUNNING or PAUSED clock for an entity, if any.
    async fn open_clock_for(&self, key: &EntityKey) -> WorkflowResult<Option<SlaClock>>;

    /// Every clock for an entity, oldest first.
    async fn clocks_for(&self, key: &EntityKey) -> WorkflowResult<Vec<SlaClock>>;

    async fn all_clocks(&self) -> WorkflowResult<Vec<SlaClock>>;
}
