// Shared harness for the integration tests: the full service over the
// in-memory store, with a manual clock and a recording escalation sink.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use review_workflow::sla::RecordingEscalationSink;
use review_workflow::workflow::{GuardContext, GuardVerdict};
use review_workflow::{
    AuditQuery, AuditRecord, AuditSink, GuardCheck, GuardRegistry, ManualTimeSource, ReviewWorkflowConfig,
    ReviewWorkflowService, Session, WorkflowDefinition, WorkflowError, WorkflowResult,
};

pub const ORG: &str = "org-1";

pub fn admin() -> Session {
    Session::new("admin-1", "ADMIN")
}

pub fn org_admin() -> Session {
    Session::new("orgadmin-1", "ORG_ADMIN")
}

pub fn lead() -> Session {
    Session::new("lead-1", "LEAD_REVIEWER")
}

pub fn program_manager() -> Session {
    Session::new("pm-1", "PROGRAM_MANAGER")
}

pub fn system() -> Session {
    Session::new("system", "SYSTEM")
}

/// Guard backed by a counter of open findings; passes at zero.
#[derive(Default)]
pub struct OpenFindings {
    pub open: AtomicUsize,
}

#[async_trait]
impl GuardCheck for OpenFindings {
    async fn check(&self, _ctx: &GuardContext) -> WorkflowResult<GuardVerdict> {
        match self.open.load(Ordering::SeqCst) {
            0 => Ok(GuardVerdict::Pass),
            n => Ok(GuardVerdict::fail(format!("{n} findings are still open"))),
        }
    }
}

pub struct AlwaysPass;

#[async_trait]
impl GuardCheck for AlwaysPass {
    async fn check(&self, _ctx: &GuardContext) -> WorkflowResult<GuardVerdict> {
        Ok(GuardVerdict::Pass)
    }
}

/// Audit sink whose writes always fail, counting the attempts.
#[derive(Default)]
pub struct FailingAudit {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl AuditSink for FailingAudit {
    async fn append(&self, _record: AuditRecord) -> WorkflowResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(WorkflowError::storage("audit table is unavailable"))
    }

    async fn query(&self, _query: &AuditQuery) -> WorkflowResult<Vec<AuditRecord>> {
        Err(WorkflowError::storage("audit table is unavailable"))
    }
}

pub struct Harness {
    pub service: ReviewWorkflowService,
    pub time: ManualTimeSource,
    pub escalations: Arc<RecordingEscalationSink>,
    pub open_findings: Arc<OpenFindings>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(None).await
    }

    /// Harness whose audit records go to `audit` instead of the in-memory store.
    pub async fn with_audit_sink(audit: Arc<dyn AuditSink>) -> Self {
        Self::build(Some(audit)).await
    }

    async fn build(audit: Option<Arc<dyn AuditSink>>) -> Self {
        let time = ManualTimeSource::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
        let escalations = Arc::new(RecordingEscalationSink::new());
        let open_findings = Arc::new(OpenFindings::default());
        let guards = GuardRegistry::new()
            .with("no_open_findings", open_findings.clone())
            .with("report_complete", Arc::new(AlwaysPass))
            .with("actions_complete", Arc::new(AlwaysPass));

        let mut builder = ReviewWorkflowService::builder(ReviewWorkflowConfig::default())
            .time_source(Arc::new(time.clone()))
            .escalation_sink(escalations.clone())
            .guards(guards);
        if let Some(audit) = audit {
            builder = builder.audit_sink(audit);
        }
        let service = builder.build();

        let definitions = Path::new(env!("CARGO_MANIFEST_DIR")).join("definitions");
        for definition in WorkflowDefinition::load_dir(&definitions).unwrap() {
            service.publish_definition(&admin(), definition).await.unwrap();
        }

        Self {
            service,
            time,
            escalations,
            open_findings,
        }
    }

    pub async fn start_review(&self, id: &str) {
        self.service
            .start_execution(&org_admin(), "REVIEW", id, Some(ORG.to_string()))
            .await
            .unwrap();
    }

    pub async fn transition(
        &self,
        session: &Session,
        id: &str,
        code: &str,
    ) -> WorkflowResult<review_workflow::TransitionOutcome> {
        self.service
            .execute_transition(
                session,
                "REVIEW",
                id,
                review_workflow::ExecuteTransitionPayload {
                    transition_code: code.to_string(),
                    ..Default::default()
                },
            )
            .await
    }
}
