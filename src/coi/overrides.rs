use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::detector::CoiDetector;
use super::types::CoiOverride;
use crate::audit::{self, AuditAction, AuditRecord, AuditSink};
use crate::error::{WorkflowError, WorkflowResult};
use crate::store::OverrideStore;
use crate::time_source::TimeSource;

/// Overrides are audited against the organization they cover.
pub const OVERRIDE_AUDIT_ENTITY: &str = "COI_OVERRIDE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideRequest {
    pub actor_id: String,
    pub organization_id: String,
    pub justification: String,
    pub approved_by: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Limit the grant to a single entity; `None` covers the whole organization.
    #[serde(default)]
    pub entity_id: Option<String>,
}

pub struct OverrideManager {
    store: Arc<dyn OverrideStore>,
    detector: Arc<CoiDetector>,
    audit: Arc<dyn AuditSink>,
    time: Arc<dyn TimeSource>,
}

impl OverrideManager {
    pub fn new(
        store: Arc<dyn OverrideStore>,
        detector: Arc<CoiDetector>,
        audit: Arc<dyn AuditSink>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            store,
            detector,
            audit,
            time,
        }
    }

    fn invalid(reason: impl Into<String>) -> WorkflowError {
        WorkflowError::InvalidOverride { reason: reason.into() }
    }

    pub async fn create_override(&self, request: OverrideRequest) -> WorkflowResult<CoiOverride> {
        let now = self.time.now();

        if request.justification.trim().is_empty() {
            return Err(Self::invalid("justification must not be empty"));
        }
        if request.expires_at.is_some_and(|expires| expires <= now) {
            return Err(Self::invalid("expiry must be in the future"));
        }

        let report = self
            .detector
            .evaluate(&request.actor_id, &request.organization_id)
            .await?;
        if report.has_hard_block {
            warn!(
                actor_id = %request.actor_id,
                organization_id = %request.organization_id,
                "Override refused: hard-block conflict present"
            );
            return Err(Self::invalid(format!(
                "{} has a conflict with {} that cannot be overridden",
                request.actor_id, request.organization_id
            )));
        }
        if !report.has_overridable() {
            return Err(Self::invalid(format!(
                "{} has no active conflict with {} to override",
                request.actor_id, request.organization_id
            )));
        }

        let grant = CoiOverride {
            id: Uuid::new_v4(),
            actor_id: request.actor_id,
            organization_id: request.organization_id,
            entity_id: request.entity_id,
            justification: request.justification,
            approved_by: request.approved_by,
            created_at: now,
            expires_at: request.expires_at,
            revoked_at: None,
            revoked_by: None,
            revocation_reason: None,
        };
        // Uniqueness of the active scope is checked inside the store's insert.
        let grant = self.store.insert_override(grant, now).await?;

        info!(
            override_id = %grant.id,
            actor_id = %grant.actor_id,
            organization_id = %grant.organization_id,
            entity_id = ?grant.entity_id,
            approved_by = %grant.approved_by,
            "COI override created"
        );
        let record = AuditRecord::new(
            &grant.approved_by,
            AuditAction::OverrideCreated,
            OVERRIDE_AUDIT_ENTITY,
            &grant.id.to_string(),
            now,
        )
        .with_change(None::<&CoiOverride>, Some(&grant));
        audit::record(self.audit.as_ref(), record).await;
        Ok(grant)
    }

    pub async fn revoke(&self, override_id: Uuid, reason: &str, revoked_by: &str) -> WorkflowResult<CoiOverride> {
        let now = self.time.now();
        if reason.trim().is_empty() {
            return Err(Self::invalid("revocation reason must not be empty"));
        }
        let before = self
            .store
            .get_override(override_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("override", override_id.to_string()))?;

        let after = self.store.revoke_override(override_id, reason, revoked_by, now).await?;

        info!(override_id = %override_id, revoked_by = %revoked_by, "COI override revoked");
        let record = AuditRecord::new(
            revoked_by,
            AuditAction::OverrideRevoked,
            OVERRIDE_AUDIT_ENTITY,
            &override_id.to_string(),
            now,
        )
        .with_change(Some(&before), Some(&after));
        audit::record(self.audit.as_ref(), record).await;
        Ok(after)
    }

    /// Entity-scoped grant first, then the organization-wide one.
    pub async fn find_active(
        &self,
        actor_id: &str,
        organization_id: &str,
        entity_id: Option<&str>,
    ) -> WorkflowResult<Option<CoiOverride>> {
        let now = self.time.now();
        let active: Vec<CoiOverride> = self
            .store
            .overrides_for(actor_id, organization_id)
            .await?
            .into_iter()
            .filter(|o| o.is_active_at(now))
            .collect();

        if let Some(entity_id) = entity_id {
            if let Some(scoped) = active
                .iter()
                .find(|o| o.same_scope(actor_id, organization_id, Some(entity_id)))
            {
                return Ok(Some(scoped.clone()));
            }
        }
        Ok(active
            .into_iter()
            .find(|o| o.same_scope(actor_id, organization_id, None)))
    }

    pub async fn list_for(&self, actor_id: &str, organization_id: &str) -> WorkflowResult<Vec<CoiOverride>> {
        self.store.overrides_for(actor_id, organization_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coi::rules::RuleSet;
    use crate::coi::types::CoiType;
    use crate::store::InMemoryStore;
    use crate::time_source::ManualTimeSource;
    use chrono::Duration;

    struct Fixture {
        detector: Arc<CoiDetector>,
        overrides: OverrideManager,
        time: ManualTimeSource,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let time = ManualTimeSource::new(Utc::now());
        let detector = Arc::new(CoiDetector::new(
            store.clone(),
            store.clone(),
            RuleSet::standard(2),
            Arc::new(time.clone()),
        ));
        let overrides = OverrideManager::new(store.clone(), detector.clone(), store, Arc::new(time.clone()));
        Fixture {
            detector,
            overrides,
            time,
        }
    }

    fn request(entity_id: Option<&str>) -> OverrideRequest {
        OverrideRequest {
            actor_id: "r1".to_string(),
            organization_id: "org-1".to_string(),
            justification: "sole qualified reviewer".to_string(),
            approved_by: "admin".to_string(),
            expires_at: None,
            entity_id: entity_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_override_requires_overridable_conflict() {
        let f = fixture();
        let err = f.overrides.create_override(request(None)).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidOverride { .. }));
    }

    #[tokio::test]
    async fn test_override_refused_for_hard_block() {
        let f = fixture();
        f.detector
            .declare("r1", "org-1", CoiType::RecentEmployment, None, "r1")
            .await
            .unwrap();
        f.detector
            .declare("r1", "org-1", CoiType::FamilyRelationship, None, "r1")
            .await
            .unwrap();

        let err = f.overrides.create_override(request(None)).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidOverride { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_active_scope_rejected() {
        let f = fixture();
        f.detector
            .declare("r1", "org-1", CoiType::FinancialInterest, None, "r1")
            .await
            .unwrap();

        f.overrides.create_override(request(None)).await.unwrap();
        let err = f.overrides.create_override(request(None)).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidOverride { .. }));

        // A different scope is allowed alongside the org-wide grant.
        f.overrides.create_override(request(Some("rev-1"))).await.unwrap();
    }

    #[tokio::test]
    async fn test_find_active_prefers_entity_scope() {
        let f = fixture();
        f.detector
            .declare("r1", "org-1", CoiType::FinancialInterest, None, "r1")
            .await
            .unwrap();
        let wide = f.overrides.create_override(request(None)).await.unwrap();
        let scoped = f.overrides.create_override(request(Some("rev-1"))).await.unwrap();

        let found = f.overrides.find_active("r1", "org-1", Some("rev-1")).await.unwrap();
        assert_eq!(found.map(|o| o.id), Some(scoped.id));

        let found = f.overrides.find_active("r1", "org-1", Some("rev-2")).await.unwrap();
        assert_eq!(found.map(|o| o.id), Some(wide.id));
    }

    #[tokio::test]
    async fn test_expired_and_revoked_overrides_are_inactive() {
        let f = fixture();
        f.detector
            .declare("r1", "org-1", CoiType::FinancialInterest, None, "r1")
            .await
            .unwrap();

        let mut expiring = request(None);
        expiring.expires_at = Some(f.time.now() + Duration::days(1));
        let grant = f.overrides.create_override(expiring).await.unwrap();

        f.time.advance(Duration::days(2));
        assert!(f.overrides.find_active("r1", "org-1", None).await.unwrap().is_none());

        let revoked = f.overrides.revoke(grant.id, "no longer needed", "admin").await.unwrap();
        assert_eq!(revoked.revoked_by.as_deref(), Some("admin"));
        let again = f.overrides.revoke(grant.id, "again", "admin").await;
        assert!(matches!(again, Err(WorkflowError::InvalidOverride { .. })));
    }

    #[tokio::test]
    async fn test_past_expiry_rejected() {
        let f = fixture();
        let mut past = request(None);
        past.expires_at = Some(f.time.now() - Duration::minutes(1));
        let err = f.overrides.create_override(past).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidOverride { .. }));
    }
}
