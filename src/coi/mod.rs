// Conflict-of-interest subsystem: rule-based detection, manual declarations,
// and administrative overrides consulted by the workflow engine.

pub mod detector;
pub mod overrides;
pub mod rules;
pub mod types;

pub use detector::{CoiDetector, SyncReport};
pub use overrides::{OverrideManager, OverrideRequest};
pub use rules::{
    ActorFacts, ConflictRule, DetectedConflict, EmploymentRecord, FinancialDisclosure, OrganizationFacts, RuleSet,
};
pub use types::{CoiOverride, CoiSeverity, CoiType, ConflictReport, ReviewerCoi};

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{WorkflowError, WorkflowResult};

/// Outcome of a clearance check that did not block.
#[derive(Debug, Clone, PartialEq)]
pub enum Clearance {
    Clear,
    /// Overridable conflicts exist but an active override covers them.
    Overridden(CoiOverride),
}

/// Detector plus override lookup, as consulted by the engine.
#[derive(Clone)]
pub struct CoiGate {
    detector: Arc<CoiDetector>,
    overrides: Arc<OverrideManager>,
}

impl CoiGate {
    pub fn new(detector: Arc<CoiDetector>, overrides: Arc<OverrideManager>) -> Self {
        Self { detector, overrides }
    }

    pub fn detector(&self) -> &Arc<CoiDetector> {
        &self.detector
    }

    pub fn overrides(&self) -> &Arc<OverrideManager> {
        &self.overrides
    }

    /// Whether the actor has an active hard block against the organization.
    pub async fn is_hard_blocked(&self, actor_id: &str, organization_id: &str) -> WorkflowResult<bool> {
        Ok(self.detector.evaluate(actor_id, organization_id).await?.has_hard_block)
    }

    /// Conflict report with the override covering `entity_id` (or the whole
    /// organization when `None`) attached.
    pub async fn check(
        &self,
        actor_id: &str,
        organization_id: &str,
        entity_id: Option<&str>,
    ) -> WorkflowResult<ConflictReport> {
        let mut report = self.detector.evaluate(actor_id, organization_id).await?;
        if report.has_conflict {
            report.active_override = self.overrides.find_active(actor_id, organization_id, entity_id).await?;
        }
        Ok(report)
    }

    pub async fn check_team(
        &self,
        actor_ids: &[String],
        organization_id: &str,
        entity_id: Option<&str>,
    ) -> WorkflowResult<BTreeMap<String, ConflictReport>> {
        let mut reports = self.detector.evaluate_team(actor_ids, organization_id).await?;
        for (actor_id, report) in reports.iter_mut().filter(|(_, r)| r.has_conflict) {
            report.active_override = self.overrides.find_active(actor_id, organization_id, entity_id).await?;
        }
        Ok(reports)
    }

    /// Fails with `ConflictOfInterest` unless the actor is clear or covered by an override.
    pub async fn check_clearance(
        &self,
        actor_id: &str,
        organization_id: &str,
        entity_id: &str,
    ) -> WorkflowResult<Clearance> {
        let report = self.check(actor_id, organization_id, Some(entity_id)).await?;
        if !report.has_conflict {
            return Ok(Clearance::Clear);
        }

        let blocked = |overridable: bool| WorkflowError::ConflictOfInterest {
            actor_id: actor_id.to_string(),
            organization_id: organization_id.to_string(),
            overridable,
            conflicts: report.conflict_types(),
        };

        if report.has_hard_block {
            return Err(blocked(false));
        }

        match report.active_override.clone() {
            Some(grant) => {
                debug!(override_id = %grant.id, actor_id = %actor_id, "Conflict covered by override");
                Ok(Clearance::Overridden(grant))
            }
            None => Err(blocked(true)),
        }
    }
}
