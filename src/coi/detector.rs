use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::rules::{ActorFacts, OrganizationFacts, RuleSet};
use super::types::{CoiSeverity, CoiType, ConflictReport, ReviewerCoi};
use crate::audit::{self, AuditAction, AuditRecord, AuditSink};
use crate::error::{WorkflowError, WorkflowResult};
use crate::store::CoiStore;
use crate::time_source::TimeSource;

/// Entity type used for COI rows in the audit feed.
pub const COI_AUDIT_ENTITY: &str = "REVIEWER_COI";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub actor_id: String,
    pub created: Vec<ReviewerCoi>,
    pub deactivated: Vec<ReviewerCoi>,
    pub unchanged: usize,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.deactivated.is_empty()
    }
}

pub struct CoiDetector {
    store: Arc<dyn CoiStore>,
    audit: Arc<dyn AuditSink>,
    rules: RuleSet,
    time: Arc<dyn TimeSource>,
}

impl CoiDetector {
    pub fn new(
        store: Arc<dyn CoiStore>,
        audit: Arc<dyn AuditSink>,
        rules: RuleSet,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            store,
            audit,
            rules,
            time,
        }
    }

    /// Conflicts active right now between `actor_id` and `organization_id`.
    pub async fn evaluate(&self, actor_id: &str, organization_id: &str) -> WorkflowResult<ConflictReport> {
        let now = self.time.now();
        let conflicts: Vec<ReviewerCoi> = self
            .store
            .cois_for_actor(actor_id)
            .await?
            .into_iter()
            .filter(|c| c.organization_id == organization_id && c.is_active_at(now))
            .collect();

        let report = ConflictReport::from_conflicts(actor_id, organization_id, conflicts);
        debug!(
            actor_id = %actor_id,
            organization_id = %organization_id,
            has_conflict = report.has_conflict,
            has_hard_block = report.has_hard_block,
            "COI evaluated"
        );
        Ok(report)
    }

    /// Batched evaluation used before assigning a review team.
    pub async fn evaluate_team(
        &self,
        actor_ids: &[String],
        organization_id: &str,
    ) -> WorkflowResult<BTreeMap<String, ConflictReport>> {
        let mut reports = BTreeMap::new();
        for actor_id in actor_ids {
            if reports.contains_key(actor_id) {
                continue;
            }
            let report = self.evaluate(actor_id, organization_id).await?;
            reports.insert(actor_id.clone(), report);
        }
        Ok(reports)
    }

    /// Reconcile auto-detected conflicts with the actor's current facts.
    ///
    /// Runs the rule set against each listed organization. Records for those
    /// organizations whose fact no longer holds are end-dated; newly qualifying facts
    /// create records. Auto-detected records for organizations not listed are left
    /// as they are and counted unchanged, since their facts were not supplied.
    /// Manually declared conflicts are never touched. Running twice with the same
    /// facts changes nothing.
    pub async fn sync(
        &self,
        actor: &ActorFacts,
        organizations: &[OrganizationFacts],
        performed_by: &str,
    ) -> WorkflowResult<SyncReport> {
        let now = self.time.now();
        let existing: Vec<ReviewerCoi> = self
            .store
            .cois_for_actor(&actor.actor_id)
            .await?
            .into_iter()
            .filter(|c| c.is_active_at(now))
            .collect();

        let universe: BTreeMap<&str, &OrganizationFacts> = organizations
            .iter()
            .map(|o| (o.organization_id.as_str(), o))
            .collect();

        let mut report = SyncReport {
            actor_id: actor.actor_id.clone(),
            unchanged: existing
                .iter()
                .filter(|c| c.is_auto_detected && !universe.contains_key(c.organization_id.as_str()))
                .count(),
            ..Default::default()
        };

        for (organization_id, org) in universe {
            let detected = self.rules.detect_all(actor, org, now);
            let detected_types: BTreeSet<CoiType> = detected.iter().map(|d| d.coi_type).collect();

            let active_here: Vec<&ReviewerCoi> = existing
                .iter()
                .filter(|c| c.organization_id == organization_id)
                .collect();

        for conflict in detected {
                // A manual declaration of the same type already covers the fact.
                if active_here.iter().any(|c| c.coi_type == conflict.coi_type) {
                    report.unchanged += 1;
                    continue;
                }
                let mut coi = ReviewerCoi::new(&actor.actor_id, organization_id, conflict.coi_type, true, now);
                coi.description = Some(conflict.description);
                report.created.push(self.store.insert_coi(coi).await?);
            }

            for stale in active_here
                .iter()
                .filter(|c| c.is_auto_detected && !detected_types.contains(&c.coi_type))
            {
                let mut ended = (*stale).clone();
                ended.active_until = Some(now);
                self.store.update_coi(ended.clone()).await?;
                report.deactivated.push(ended);
            }
        }

        if !report.is_noop() {
            info!(
                actor_id = %actor.actor_id,
                created = report.created.len(),
                deactivated = report.deactivated.len(),
                "COI auto-detection reconciled"
            );
            let record = AuditRecord::new(performed_by, AuditAction::CoiSynced, COI_AUDIT_ENTITY, &actor.actor_id, now)
                .with_change(Some(&report.deactivated), Some(&report.created));
            audit::record(self.audit.as_ref(), record).await;
        }

        Ok(report)
    }

    /// Record a manually declared conflict. Declaring an already-active type is a no-op
    /// that returns the existing record.
    pub async fn declare(
        &self,
        actor_id: &str,
        organization_id: &str,
        coi_type: CoiType,
        description: Option<String>,
        declared_by: &str,
    ) -> WorkflowResult<ReviewerCoi> {
        let now = self.time.now();
        if let Some(existing) = self
            .store
            .cois_for_actor(actor_id)
            .await?
            .into_iter()
            .find(|c| c.organization_id == organization_id && c.coi_type == coi_type && c.is_active_at(now))
        {
            return Ok(existing);
        }

        let mut coi = ReviewerCoi::new(actor_id, organization_id, coi_type, false, now);
        coi.description = description;
        coi.declared_by = Some(declared_by.to_string());
        let coi = self.store.insert_coi(coi).await?;

        info!(
            actor_id = %actor_id,
            organization_id = %organization_id,
            coi_type = %coi_type,
            "COI declared"
        );
        let record = AuditRecord::new(declared_by, AuditAction::CoiDeclared, COI_AUDIT_ENTITY, &coi.id.to_string(), now)
            .with_change(None::<&ReviewerCoi>, Some(&coi));
        audit::record(self.audit.as_ref(), record).await;
        Ok(coi)
    }

    /// End-date a manual declaration. Auto-detected records are owned by `sync`.
    pub async fn withdraw(&self, coi_id: Uuid, withdrawn_by: &str) -> WorkflowResult<ReviewerCoi> {
        let now = self.time.now();
        let coi = self
            .store
            .get_coi(coi_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("conflict of interest", coi_id.to_string()))?;
        if coi.is_auto_detected {
            return Err(WorkflowError::Forbidden {
                role: withdrawn_by.to_string(),
                action: "withdraw an auto-detected conflict".to_string(),
            });
        }
        if !coi.is_active_at(now) {
            return Ok(coi);
        }

        let mut ended = coi.clone();
        ended.active_until = Some(now);
        self.store.update_coi(ended.clone()).await?;

        let record = AuditRecord::new(withdrawn_by, AuditAction::CoiWithdrawn, COI_AUDIT_ENTITY, &coi_id.to_string(), now)
            .with_change(Some(&coi), Some(&ended));
        audit::record(self.audit.as_ref(), record).await;
        Ok(ended)
    }

    /// Administrator escalation of an overridable conflict to a hard block.
    pub async fn escalate_severity(&self, coi_id: Uuid, escalated_by: &str) -> WorkflowResult<ReviewerCoi> {
        let now = self.time.now();
        let coi = self
            .store
            .get_coi(coi_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("conflict of interest", coi_id.to_string()))?;
        if coi.severity == CoiSeverity::HardBlock {
            return Ok(coi);
        }

        let mut escalated = coi.clone();
        escalated.severity = CoiSeverity::HardBlock;
        self.store.update_coi(escalated.clone()).await?;

        info!(coi_id = %coi_id, coi_type = %coi.coi_type, "COI escalated to hard block");
        let record = AuditRecord::new(
            escalated_by,
            AuditAction::CoiSeverityEscalated,
            COI_AUDIT_ENTITY,
            &coi_id.to_string(),
            now,
        )
        .with_change(Some(&coi), Some(&escalated));
        audit::record(self.audit.as_ref(), record).await;
        Ok(escalated)
    }
}
