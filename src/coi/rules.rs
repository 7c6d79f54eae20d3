// Conflict auto-detection rules.
// Each rule maps (actor facts, organization facts) to at most one conflict of its own type,
// so new conflict types plug in without touching the detector, gate or override manager.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::types::CoiType;

/// Profile facts about an actor, supplied by the surrounding application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActorFacts {
    pub actor_id: String,
    pub home_organization_id: Option<String>,
    /// Organizations where a declared family member works or holds office.
    #[serde(default)]
    pub family_organization_ids: Vec<String>,
    #[serde(default)]
    pub employment_history: Vec<EmploymentRecord>,
    #[serde(default)]
    pub financial_interests: Vec<FinancialDisclosure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmploymentRecord {
    pub organization_id: String,
    /// `None` while the employment is ongoing.
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialDisclosure {
    pub organization_id: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrganizationFacts {
    pub organization_id: String,
    /// Sibling or parent organizations treated as the same employer.
    #[serde(default)]
    pub affiliated_organization_ids: Vec<String>,
}

impl OrganizationFacts {
    pub fn new(organization_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            affiliated_organization_ids: Vec::new(),
        }
    }

    /// True when `organization_id` names this organization or an affiliate.
    pub fn matches(&self, organization_id: &str) -> bool {
        self.organization_id == organization_id
            || self
                .affiliated_organization_ids
                .iter()
                .any(|o| o == organization_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedConflict {
    pub coi_type: CoiType,
    pub description: String,
}

pub trait ConflictRule: Send + Sync {
    fn coi_type(&self) -> CoiType;

    fn detect(
        &self,
        actor: &ActorFacts,
        organization: &OrganizationFacts,
        now: DateTime<Utc>,
    ) -> Option<DetectedConflict>;
}

pub struct HomeOrganizationRule;

impl ConflictRule for HomeOrganizationRule {
    fn coi_type(&self) -> CoiType {
        CoiType::HomeOrganization
    }

    fn detect(&self, actor: &ActorFacts, org: &OrganizationFacts, _now: DateTime<Utc>) -> Option<DetectedConflict> {
        let home = actor.home_organization_id.as_deref()?;
        org.matches(home).then(|| DetectedConflict {
            coi_type: CoiType::HomeOrganization,
            description: format!("home organization is {home}"),
        })
    }
}

pub struct FamilyRelationshipRule;

impl ConflictRule for FamilyRelationshipRule {
    fn coi_type(&self) -> CoiType {
        CoiType::FamilyRelationship
    }

    fn detect(&self, actor: &ActorFacts, org: &OrganizationFacts, _now: DateTime<Utc>) -> Option<DetectedConflict> {
        actor
            .family_organization_ids
            .iter()
            .find(|o| org.matches(o))
            .map(|o| DetectedConflict {
                coi_type: CoiType::FamilyRelationship,
                description: format!("declared family tie with {o}"),
            })
    }
}

/// Employment at the organization that ended less than `window` ago, or is ongoing.
pub struct RecentEmploymentRule {
    pub window: Duration,
}

impl ConflictRule for RecentEmploymentRule {
    fn coi_type(&self) -> CoiType {
        CoiType::RecentEmployment
    }

    fn detect(&self, actor: &ActorFacts, org: &OrganizationFacts, now: DateTime<Utc>) -> Option<DetectedConflict> {
        // A current home organization is covered by the hard-block rule.
        actor
            .employment_history
            .iter()
            .filter(|e| org.matches(&e.organization_id))
            .filter(|e| actor.home_organization_id.as_deref() != Some(e.organization_id.as_str()))
            .find(|e| e.ended_at.is_none_or(|ended| now - ended < self.window))
            .map(|e| DetectedConflict {
                coi_type: CoiType::RecentEmployment,
                description: match e.ended_at {
                    Some(ended) => format!(
                        "employed by {} until {}",
                        e.organization_id,
                        ended.format("%Y-%m-%d")
                    ),
                    None => format!("currently employed by {}", e.organization_id),
                },
            })
    }
}

pub struct FinancialInterestRule;

impl ConflictRule for FinancialInterestRule {
    fn coi_type(&self) -> CoiType {
        CoiType::FinancialInterest
    }

    fn detect(&self, actor: &ActorFacts, org: &OrganizationFacts, _now: DateTime<Utc>) -> Option<DetectedConflict> {
        actor
            .financial_interests
            .iter()
            .find(|d| org.matches(&d.organization_id))
            .map(|d| DetectedConflict {
                coi_type: CoiType::FinancialInterest,
                description: d.description.clone(),
            })
    }
}

/// Ordered rule set; evaluation is deterministic and yields one conflict per type at most.
pub struct RuleSet {
    rules: Vec<Box<dyn ConflictRule>>,
}

impl RuleSet {
    pub fn new(rules: Vec<Box<dyn ConflictRule>>) -> Self {
        Self { rules }
    }

    pub fn standard(recent_employment_years: i64) -> Self {
        Self::new(vec![
            Box::new(HomeOrganizationRule),
            Box::new(FamilyRelationshipRule),
            Box::new(RecentEmploymentRule {
                window: Duration::try_days(recent_employment_years.saturating_mul(365)).unwrap_or(Duration::MAX),
            }),
            Box::new(FinancialInterestRule),
        ])
    }

    pub fn with_rule(mut self, rule: Box<dyn ConflictRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn detect_all(
        &self,
        actor: &ActorFacts,
        organization: &OrganizationFacts,
        now: DateTime<Utc>,
    ) -> Vec<DetectedConflict> {
        let mut detected: Vec<DetectedConflict> = Vec::new();
        for rule in &self.rules {
            if detected.iter().any(|d| d.coi_type == rule.coi_type()) {
                continue;
            }
            if let Some(conflict) = rule.detect(actor, organization, now) {
                detected.push(conflict);
            }
        }
        detected
    }
}

impl std::fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleSet")
            .field(
                "rules",
                &self.rules.iter().map(|r| r.coi_type()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
