// RPC boundary. The performer always comes from the authenticated session;
// request payloads never carry an actor identity.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{instrument, Instrument};
use uuid::Uuid;

use crate::analytics::{AnalyticsFilter, AnalyticsReport, WorkflowAnalytics};
use crate::audit::{AuditQuery, AuditRecord, AuditSink};
use crate::coi::{
    ActorFacts, CoiDetector, CoiGate, CoiOverride, CoiType, ConflictReport, OrganizationFacts, OverrideManager,
    OverrideRequest, ReviewerCoi, RuleSet, SyncReport,
};
use crate::config::ReviewWorkflowConfig;
use crate::error::{WorkflowError, WorkflowResult};
use crate::sla::{EscalationSink, SlaClock, SlaService, SweepReport, TracingEscalationSink};
use crate::store::{ExecutionStore, InMemoryStore};
use crate::telemetry::{create_request_span, generate_correlation_id};
use crate::time_source::{SystemTimeSource, TimeSource};
use crate::workflow::{
    Actor, CurrentState, DefinitionStore, EntityKey, GuardRegistry, HistoryEntry, Role, TransitionOutcome,
    TransitionRequest, WorkflowDefinition, WorkflowEngine, WorkflowExecution, WorkflowTransition,
};

/// Authenticated caller, supplied by the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub actor_id: String,
    pub role: Role,
    /// Caller-supplied request id; one is generated per call when absent.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl Session {
    pub fn new(actor_id: impl Into<String>, role: impl Into<Role>) -> Self {
        Self {
            actor_id: actor_id.into(),
            role: role.into(),
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    fn request_span(&self, operation: &str) -> tracing::Span {
        let correlation_id = self.correlation_id.clone().unwrap_or_else(generate_correlation_id);
        create_request_span(operation, &self.actor_id, &correlation_id)
    }

    pub fn actor(&self) -> Actor {
        Actor {
            id: self.actor_id.clone(),
            role: self.role.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteTransitionPayload {
    pub transition_code: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOverridePayload {
    pub actor_id: String,
    pub organization_id: String,
    pub justification: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entity_id: Option<String>,
}

pub struct ReviewWorkflowService {
    engine: Arc<WorkflowEngine>,
    coi: CoiGate,
    sla: Arc<SlaService>,
    analytics: WorkflowAnalytics,
    audit: Arc<dyn AuditSink>,
    config: ReviewWorkflowConfig,
}

impl ReviewWorkflowService {
    pub fn builder(config: ReviewWorkflowConfig) -> ServiceBuilder {
        ServiceBuilder::new(config)
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn sla(&self) -> &Arc<SlaService> {
        &self.sla
    }

    fn require_elevated(&self, session: &Session, action: &str) -> WorkflowResult<()> {
        if self.config.is_elevated(session.role.as_str()) {
            Ok(())
        } else {
            Err(WorkflowError::Forbidden {
                role: session.role.to_string(),
                action: action.to_string(),
            })
        }
    }

    // Definitions and executions

    #[instrument(skip_all, fields(entity_type = %definition.entity_type))]
    pub async fn publish_definition(
        &self,
        session: &Session,
        definition: WorkflowDefinition,
    ) -> WorkflowResult<Arc<WorkflowDefinition>> {
        self.require_elevated(session, "publish a workflow definition")?;
        in_request(
            session,
            "publish_definition",
            self.engine.definitions().publish(definition, &session.actor_id),
        )
        .await
    }

    #[instrument(skip_all, fields(entity_type = %entity_type, entity_id = %entity_id))]
    pub async fn start_execution(
        &self,
        session: &Session,
        entity_type: &str,
        entity_id: &str,
        organization_id: Option<String>,
    ) -> WorkflowResult<WorkflowExecution> {
        let actor = session.actor();
        in_request(
            session,
            "start_execution",
            self.engine.start(entity_type, entity_id, organization_id, &actor),
        )
        .await
    }

    #[instrument(skip_all, fields(actor = %session.actor_id, entity_type = %entity_type, entity_id = %entity_id))]
    pub async fn transitions(
        &self,
        session: &Session,
        entity_type: &str,
        entity_id: &str,
    ) -> WorkflowResult<Vec<WorkflowTransition>> {
        self.engine
            .get_available_transitions(entity_type, entity_id, &session.actor())
            .await
    }

    #[instrument(skip_all, fields(entity_type = %entity_type, entity_id = %entity_id, code = %payload.transition_code))]
    pub async fn execute_transition(
        &self,
        session: &Session,
        entity_type: &str,
        entity_id: &str,
        payload: ExecuteTransitionPayload,
    ) -> WorkflowResult<TransitionOutcome> {
        let request = TransitionRequest {
            transition_code: payload.transition_code,
            performer: session.actor(),
            comment: payload.comment,
            metadata: payload.metadata,
            expected_version: payload.expected_version,
        };
        in_request(
            session,
            "execute_transition",
            self.engine.execute_transition(entity_type, entity_id, request),
        )
        .await
    }

    pub async fn history(&self, entity_type: &str, entity_id: &str) -> WorkflowResult<Vec<HistoryEntry>> {
        self.engine.get_history(entity_type, entity_id).await
    }

    pub async fn current_state(&self, entity_type: &str, entity_id: &str) -> WorkflowResult<CurrentState> {
        self.engine.get_current_state(entity_type, entity_id).await
    }

    // Conflicts of interest

    /// Active conflicts, plus the override covering `entity_id` (or the whole
    /// organization when `None`) if there is one.
    pub async fn coi_check(
        &self,
        actor_id: &str,
        organization_id: &str,
        entity_id: Option<&str>,
    ) -> WorkflowResult<ConflictReport> {
        self.coi.check(actor_id, organization_id, entity_id).await
    }

    pub async fn coi_check_team(
        &self,
        actor_ids: &[String],
        organization_id: &str,
        entity_id: Option<&str>,
    ) -> WorkflowResult<BTreeMap<String, ConflictReport>> {
        self.coi.check_team(actor_ids, organization_id, entity_id).await
    }

    #[instrument(skip_all, fields(organization_id = %organization_id, coi_type = %coi_type))]
    pub async fn declare_coi(
        &self,
        session: &Session,
        organization_id: &str,
        coi_type: CoiType,
        description: Option<String>,
    ) -> WorkflowResult<ReviewerCoi> {
        in_request(
            session,
            "declare_coi",
            self.coi
                .detector()
                .declare(&session.actor_id, organization_id, coi_type, description, &session.actor_id),
        )
        .await
    }

    /// Reconcile another actor's auto-detected conflicts. Restricted to elevated
    /// roles and the SYSTEM role used by directory sync jobs.
    pub async fn sync_coi(
        &self,
        session: &Session,
        facts: &ActorFacts,
        organizations: &[OrganizationFacts],
    ) -> WorkflowResult<SyncReport> {
        if session.role.as_str() != Role::SYSTEM {
            self.require_elevated(session, "sync auto-detected conflicts")?;
        }
        in_request(
            session,
            "sync_coi",
            self.coi.detector().sync(facts, organizations, &session.actor_id),
        )
        .await
    }

    pub async fn escalate_coi(&self, session: &Session, coi_id: Uuid) -> WorkflowResult<ReviewerCoi> {
        self.require_elevated(session, "escalate a conflict of interest")?;
        in_request(
            session,
            "escalate_coi",
            self.coi.detector().escalate_severity(coi_id, &session.actor_id),
        )
        .await
    }

    #[instrument(skip_all, fields(for_actor = %payload.actor_id))]
    pub async fn create_override(
        &self,
        session: &Session,
        payload: CreateOverridePayload,
    ) -> WorkflowResult<CoiOverride> {
        self.require_elevated(session, "create a COI override")?;
        let request = OverrideRequest {
            actor_id: payload.actor_id,
            organization_id: payload.organization_id,
            justification: payload.justification,
            approved_by: session.actor_id.clone(),
            expires_at: payload.expires_at,
            entity_id: payload.entity_id,
        };
        in_request(session, "create_override", self.coi.overrides().create_override(request))
            .await
    }

    #[instrument(skip_all, fields(override_id = %override_id))]
    pub async fn revoke_override(
        &self,
        session: &Session,
        override_id: Uuid,
        reason: &str,
    ) -> WorkflowResult<CoiOverride> {
        self.require_elevated(session, "revoke a COI override")?;
        in_request(
            session,
            "revoke_override",
            self.coi.overrides().revoke(override_id, reason, &session.actor_id),
        )
        .await
    }

    /// Every override ever granted for the pair, including revoked and expired ones.
    pub async fn list_overrides(
        &self,
        session: &Session,
        actor_id: &str,
        organization_id: &str,
    ) -> WorkflowResult<Vec<CoiOverride>> {
        self.require_elevated(session, "list COI overrides")?;
        self.coi.overrides().list_for(actor_id, organization_id).await
    }

    // SLA clocks

    pub async fn sla_current(&self, entity_type: &str, entity_id: &str) -> WorkflowResult<Option<SlaClock>> {
        self.sla.current(&EntityKey::new(entity_type, entity_id)).await
    }

    pub async fn sla_history(&self, entity_type: &str, entity_id: &str) -> WorkflowResult<Vec<SlaClock>> {
        self.sla.history(&EntityKey::new(entity_type, entity_id)).await
    }

    pub async fn sla_approaching_breaches(&self, warning_days: Option<i64>) -> WorkflowResult<Vec<SlaClock>> {
        let days = warning_days.unwrap_or(self.config.sla.default_warning_days);
        self.sla.get_approaching_breaches(days).await
    }

    #[instrument(skip_all, fields(clock_id = %clock_id))]
    pub async fn sla_pause(&self, session: &Session, clock_id: Uuid) -> WorkflowResult<SlaClock> {
        self.require_elevated(session, "pause an SLA clock")?;
        in_request(session, "sla_pause", self.sla.pause(clock_id, &session.actor_id))
            .await
    }

    #[instrument(skip_all, fields(clock_id = %clock_id))]
    pub async fn sla_resume(&self, session: &Session, clock_id: Uuid) -> WorkflowResult<SlaClock> {
        self.require_elevated(session, "resume an SLA clock")?;
        in_request(session, "sla_resume", self.sla.resume(clock_id, &session.actor_id))
            .await
    }

    #[instrument(skip_all, fields(clock_id = %clock_id, additional_days = additional_days))]
    pub async fn sla_extend(
        &self,
        session: &Session,
        clock_id: Uuid,
        additional_days: i64,
    ) -> WorkflowResult<SlaClock> {
        self.require_elevated(session, "extend an SLA clock")?;
        in_request(
            session,
            "sla_extend",
            self.sla.extend(clock_id, additional_days, &session.actor_id),
        )
        .await
    }

    pub async fn sla_sweep(&self) -> WorkflowResult<SweepReport> {
        self.sla.run_sweep().await
    }

    // Reporting

    pub async fn workflow_analytics(
        &self,
        session: &Session,
        filter: AnalyticsFilter,
    ) -> WorkflowResult<AnalyticsReport> {
        self.require_elevated(session, "view workflow analytics")?;
        self.analytics.workflow_analytics(filter).await
    }

    pub async fn audit_log(&self, session: &Session, query: &AuditQuery) -> WorkflowResult<Vec<AuditRecord>> {
        self.require_elevated(session, "read the audit log")?;
        self.audit.query(query).await
    }
}

/// Run one mutating call inside a request span tagged with the session's
/// actor and correlation id.
async fn in_request<T, F>(session: &Session, operation: &str, call: F) -> WorkflowResult<T>
where
    F: Future<Output = WorkflowResult<T>>,
{
    call.instrument(session.request_span(operation)).await
}

/// Wires the components over a shared in-memory store, with optional replacements
/// for the execution store and audit sink.
pub struct ServiceBuilder {
    config: ReviewWorkflowConfig,
    store: Arc<InMemoryStore>,
    executions: Option<Arc<dyn ExecutionStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    escalations: Arc<dyn EscalationSink>,
    time: Arc<dyn TimeSource>,
    guards: GuardRegistry,
}

impl ServiceBuilder {
    pub fn new(config: ReviewWorkflowConfig) -> Self {
        Self {
            config,
            store: Arc::new(InMemoryStore::new()),
            executions: None,
            audit: None,
            escalations: Arc::new(TracingEscalationSink),
            time: Arc::new(SystemTimeSource),
            guards: GuardRegistry::new(),
        }
    }

    pub fn store(mut self, store: Arc<InMemoryStore>) -> Self {
        self.store = store;
        self
    }

    pub fn execution_store(mut self, executions: Arc<dyn ExecutionStore>) -> Self {
        self.executions = Some(executions);
        self
    }

    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn escalation_sink(mut self, escalations: Arc<dyn EscalationSink>) -> Self {
        self.escalations = escalations;
        self
    }

    pub fn time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    pub fn guards(mut self, guards: GuardRegistry) -> Self {
        self.guards = guards;
        self
    }

    pub fn build(self) -> ReviewWorkflowService {
        let store = self.store;
        let time = self.time;
        let audit: Arc<dyn AuditSink> = self.audit.unwrap_or_else(|| store.clone() as Arc<dyn AuditSink>);
        let executions: Arc<dyn ExecutionStore> = self.executions.unwrap_or_else(|| store.clone() as Arc<dyn ExecutionStore>);

        let definitions = Arc::new(DefinitionStore::new(
            store.clone(),
            audit.clone(),
            time.clone(),
            self.config.definitions.cache_capacity,
            std::time::Duration::from_secs(self.config.definitions.cache_ttl_seconds),
        ));
        let detector = Arc::new(CoiDetector::new(
            store.clone(),
            audit.clone(),
            RuleSet::standard(self.config.coi.recent_employment_years),
            time.clone(),
        ));
        let overrides = Arc::new(OverrideManager::new(store.clone(), detector.clone(), audit.clone(), time.clone()));
        let coi = CoiGate::new(detector, overrides);
        let sla = Arc::new(SlaService::new(
            store.clone(),
            audit.clone(),
            self.escalations,
            time.clone(),
            Duration::try_hours(self.config.sla.repeat_interval_hours).unwrap_or(Duration::days(1)),
        ));
        let engine = Arc::new(WorkflowEngine::new(
            definitions,
            executions.clone(),
            coi.clone(),
            sla.clone(),
            self.guards,
            audit.clone(),
            time.clone(),
        ));
        let analytics = WorkflowAnalytics::new(executions, store, time);

        ReviewWorkflowService {
            engine,
            coi,
            sla,
            analytics,
            audit,
            config: self.config,
        }
    }
}
