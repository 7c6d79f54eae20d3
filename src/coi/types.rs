use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoiType {
    HomeOrganization,
    FamilyRelationship,
    RecentEmployment,
    FinancialInterest,
}

impl CoiType {
    /// Home-organization and family ties can never be overridden.
    pub fn default_severity(self) -> CoiSeverity {
        match self {
            CoiType::HomeOrganization | CoiType::FamilyRelationship => CoiSeverity::HardBlock,
            CoiType::RecentEmployment | CoiType::FinancialInterest => CoiSeverity::Overridable,
        }
    }

    pub fn is_always_hard_block(self) -> bool {
        self.default_severity() == CoiSeverity::HardBlock
    }
}

impl fmt::Display for CoiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoiType::HomeOrganization => "HOME_ORGANIZATION",
            CoiType::FamilyRelationship => "FAMILY_RELATIONSHIP",
            CoiType::RecentEmployment => "RECENT_EMPLOYMENT",
            CoiType::FinancialInterest => "FINANCIAL_INTEREST",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoiSeverity {
    HardBlock,
    Overridable,
}

/// A declared or auto-detected conflict between an actor and an organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewerCoi {
    pub id: Uuid,
    pub actor_id: String,
    pub organization_id: String,
    pub coi_type: CoiType,
    pub severity: CoiSeverity,
    pub is_auto_detected: bool,
    pub description: Option<String>,
    /// Who declared it; `None` for auto-detected records.
    pub declared_by: Option<String>,
    pub active_from: DateTime<Utc>,
    pub active_until: Option<DateTime<Utc>>,
}

impl ReviewerCoi {
    pub fn new(
        actor_id: &str,
        organization_id: &str,
        coi_type: CoiType,
        is_auto_detected: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor_id: actor_id.to_string(),
            organization_id: organization_id.to_string(),
            coi_type,
            severity: coi_type.default_severity(),
            is_auto_detected,
            description: None,
            declared_by: None,
            active_from: now,
            active_until: None,
        }
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.active_from <= now && self.active_until.is_none_or(|until| now < until)
    }

    pub fn is_hard_block(&self) -> bool {
        self.severity == CoiSeverity::HardBlock
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub actor_id: String,
    pub organization_id: String,
    pub has_conflict: bool,
    pub has_hard_block: bool,
    pub conflicts: Vec<ReviewerCoi>,
    /// Override in force for the checked scope, looked up only when conflicts exist.
    #[serde(default)]
    pub active_override: Option<CoiOverride>,
}

impl ConflictReport {
    pub fn from_conflicts(actor_id: &str, organization_id: &str, conflicts: Vec<ReviewerCoi>) -> Self {
        Self {
            actor_id: actor_id.to_string(),
            organization_id: organization_id.to_string(),
            has_conflict: !conflicts.is_empty(),
            has_hard_block: conflicts.iter().any(ReviewerCoi::is_hard_block),
            conflicts,
            active_override: None,
        }
    }

    /// No conflict, or only overridable ones covered by an active override.
    pub fn is_cleared(&self) -> bool {
        !self.has_conflict || (!self.has_hard_block && self.active_override.is_some())
    }

    pub fn conflict_types(&self) -> Vec<CoiType> {
        self.conflicts.iter().map(|c| c.coi_type).collect()
    }

    pub fn has_overridable(&self) -> bool {
        self.conflicts.iter().any(|c| !c.is_hard_block())
    }
}

/// Administrative grant letting an actor act despite an overridable conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoiOverride {
    pub id: Uuid,
    pub actor_id: String,
    pub organization_id: String,
    /// `None` covers every entity of the organization.
    pub entity_id: Option<String>,
    pub justification: String,
    pub approved_by: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_by: Option<String>,
    pub revocation_reason: Option<String>,
}

impl CoiOverride {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.is_none_or(|expires| now < expires)
    }

    /// Uniqueness key for "at most one active override per scope".
    pub fn scope_key(&self) -> (String, String, Option<String>) {
        (
            self.actor_id.clone(),
            self.organization_id.clone(),
            self.entity_id.clone(),
        )
    }

    pub fn same_scope(&self, actor_id: &str, organization_id: &str, entity_id: Option<&str>) -> bool {
        self.actor_id == actor_id
            && self.organization_id == organization_id
            && self.entity_id.as_deref() == entity_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_default_severity_per_type() {
        assert_eq!(CoiType::HomeOrganization.default_severity(), CoiSeverity::HardBlock);
        assert_eq!(CoiType::FamilyRelationship.default_severity(), CoiSeverity::HardBlock);
        assert_eq!(CoiType::RecentEmployment.default_severity(), CoiSeverity::Overridable);
        assert_eq!(CoiType::FinancialInterest.default_severity(), CoiSeverity::Overridable);
    }

    #[test]
    fn test_coi_activity_window() {
        let now = Utc::now();
        let mut coi = ReviewerCoi::new("r1", "org1", CoiType::RecentEmployment, true, now);
        assert!(coi.is_active_at(now));
        assert!(!coi.is_active_at(now - Duration::seconds(1)));

        coi.active_until = Some(now + Duration::days(1));
        assert!(coi.is_active_at(now + Duration::hours(23)));
        assert!(!coi.is_active_at(now + Duration::days(1)));
    }

    #[test]
    fn test_report_flags() {
        let now = Utc::now();
        let soft = ReviewerCoi::new("r1", "org1", CoiType::FinancialInterest, false, now);
        let report = ConflictReport::from_conflicts("r1", "org1", vec![soft.clone()]);
        assert!(report.has_conflict);
        assert!(!report.has_hard_block);
        assert!(report.has_overridable());

        let hard = ReviewerCoi::new("r1", "org1", CoiType::HomeOrganization, true, now);
        let report = ConflictReport::from_conflicts("r1", "org1", vec![soft, hard]);
        assert!(report.has_hard_block);

        let clean = ConflictReport::from_conflicts("r1", "org1", Vec::new());
        assert!(!clean.has_conflict);
    }

    #[test]
    fn test_override_expiry_and_revocation() {
        let now = Utc::now();
        let mut grant = CoiOverride {
            id: Uuid::new_v4(),
            actor_id: "r1".to_string(),
            organization_id: "org1".to_string(),
            entity_id: None,
            justification: "only qualified reviewer".to_string(),
            approved_by: "admin".to_string(),
            created_at: now,
            expires_at: Some(now + Duration::days(30)),
            revoked_at: None,
            revoked_by: None,
            revocation_reason: None,
        };
        assert!(grant.is_active_at(now));
        assert!(!grant.is_active_at(now + Duration::days(30)));

        grant.revoked_at = Some(now);
        assert!(!grant.is_active_at(now));
    }
}
