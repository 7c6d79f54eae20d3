// Workflow definitions - the versioned state/transition graph for one entity type.
// A definition is validated for graph integrity before it can be published.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use crate::error::{WorkflowError, WorkflowResult};

static STATE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Z0-9_]*$").expect("state code pattern is valid"));
static TRANSITION_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("transition code pattern is valid"));

/// Upper bound for any day count in a definition or an SLA extension.
pub const MAX_SLA_DAYS: i64 = 3650;

/// An actor role as named in a transition's allowed-role set (e.g. `ORG_ADMIN`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(pub String);

impl Role {
    pub const SYSTEM: &'static str = "SYSTEM";

    pub fn new(role: impl Into<String>) -> Self {
        Role(role.into())
    }

    /// Role used by jobs that fire SYSTEM-trigger transitions.
    pub fn system() -> Self {
        Role(Self::SYSTEM.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Role {
    fn from(role: &str) -> Self {
        Role(role.to_string())
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionTrigger {
    /// Explicit user action from a screen.
    User,
    /// Fired by a job or another mutation through the same execute contract.
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationThreshold {
    /// Fire once the remaining time drops to `days` or less.
    DaysBeforeDue { days: i64 },
    /// Fire when the deadline has passed.
    OnBreach,
}

impl EscalationThreshold {
    /// Key recorded on a clock once this threshold has fired.
    pub fn key(&self) -> String {
        match self {
            EscalationThreshold::DaysBeforeDue { days } => format!("warn:{days}"),
            EscalationThreshold::OnBreach => "breach".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationRepeat {
    #[default]
    Once,
    Repeating,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRule {
    pub threshold: EscalationThreshold,
    /// Notification target (role or distribution list) handed to the escalation sink.
    pub notify: String,
    #[serde(default)]
    pub repeat: EscalationRepeat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub code: String,
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_initial: bool,
    #[serde(default)]
    pub is_terminal: bool,
    #[serde(default)]
    pub sort_order: i32,
    /// Default SLA duration for time spent in this state.
    #[serde(default)]
    pub sla_days: Option<i64>,
    #[serde(default)]
    pub escalation_rules: Vec<EscalationRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionGuards {
    /// Actor must be clear of unresolved conflicts with the entity's organization.
    #[serde(default)]
    pub requires_coi_clearance: bool,
    /// Named business preconditions evaluated by registered guard checks.
    #[serde(default)]
    pub checks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTransition {
    pub code: String,
    #[serde(default)]
    pub label: String,
    pub from_state: String,
    pub to_state: String,
    pub trigger: TransitionTrigger,
    pub allowed_roles: BTreeSet<Role>,
    #[serde(default)]
    pub guards: TransitionGuards,
}

impl WorkflowTransition {
    pub fn allows(&self, role: &Role) -> bool {
        self.allowed_roles.contains(role)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub entity_type: String,
    #[serde(default)]
    pub name: String,
    /// Assigned by the store on publish.
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub is_active: bool,
    pub states: Vec<WorkflowState>,
    #[serde(default)]
    pub transitions: Vec<WorkflowTransition>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

impl WorkflowDefinition {
    /// Identifier of one published version, e.g. `REVIEW@3`.
    pub fn definition_id(&self) -> String {
        format!("{}@{}", self.entity_type, self.version)
    }

    pub fn from_toml_str(content: &str) -> WorkflowResult<Self> {
        let mut definition: WorkflowDefinition =
            toml::from_str(content).map_err(|e| WorkflowError::InvalidDefinition {
                reason: format!("failed to parse definition: {e}"),
            })?;
        definition.states.sort_by_key(|s| s.sort_order);
        Ok(definition)
    }

    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))
    }

    /// Load every `*.toml` definition in a directory, sorted by file name.
    pub fn load_dir(dir: &Path) -> anyhow::Result<Vec<Self>> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();

        paths.iter().map(|p| Self::from_toml_file(p)).collect()
    }

    pub fn state(&self, code: &str) -> Option<&WorkflowState> {
        self.states.iter().find(|s| s.code == code)
    }

    pub fn initial_state(&self) -> Option<&WorkflowState> {
        self.states.iter().find(|s| s.is_initial)
    }

    pub fn outgoing<'a>(&'a self, from_state: &'a str) -> impl Iterator<Item = &'a WorkflowTransition> {
        self.transitions.iter().filter(move |t| t.from_state == from_state)
    }

    /// Resolve the edge named `code` leaving `from_state`.
    pub fn transition(&self, from_state: &str, code: &str) -> Option<&WorkflowTransition> {
        self.transitions
            .iter()
            .find(|t| t.from_state == from_state && t.code == code)
    }

    /// Inactive copy to edit; published definitions are never edited in place.
    pub fn draft_clone(&self) -> Self {
        Self {
            version: self.version + 1,
            is_active: false,
            published_at: None,
            ..self.clone()
        }
    }

    /// Check graph integrity. Returns the first violation found.
    pub fn validate(&self) -> WorkflowResult<()> {
        let invalid = |reason: String| Err(WorkflowError::InvalidDefinition { reason });

        if self.entity_type.trim().is_empty() {
            return invalid("entity type is empty".to_string());
        }
        if self.states.is_empty() {
            return invalid(format!("{} defines no states", self.entity_type));
        }

        let mut codes = HashSet::new();
        for state in &self.states {
            if !STATE_CODE.is_match(&state.code) {
                return invalid(format!("state code '{}' is not UPPER_SNAKE_CASE", state.code));
            }
            if !codes.insert(state.code.as_str()) {
                return invalid(format!("duplicate state '{}'", state.code));
            }
            if state.sla_days.is_some_and(|d| d <= 0) {
                return invalid(format!("state '{}' has a non-positive SLA", state.code));
            }
            if state.sla_days.is_some_and(|d| d > MAX_SLA_DAYS) {
                return invalid(format!(
                    "state '{}' has an SLA over {MAX_SLA_DAYS} days",
                    state.code
                ));
            }
            for rule in &state.escalation_rules {
                if let EscalationThreshold::DaysBeforeDue { days } = rule.threshold {
                    if !(0..=MAX_SLA_DAYS).contains(&days) {
                        return invalid(format!(
                            "state '{}' has an escalation threshold of {days} days",
                            state.code
                        ));
                    }
                }
            }
            if state.is_initial && state.is_terminal {
                return invalid(format!("state '{}' is both initial and terminal", state.code));
            }
        }

        let initial: Vec<_> = self.states.iter().filter(|s| s.is_initial).collect();
        if initial.len() != 1 {
            return invalid(format!(
                "expected exactly one initial state, found {}",
                initial.len()
            ));
        }

        let mut edges = HashSet::new();
        for transition in &self.transitions {
            if !TRANSITION_CODE.is_match(&transition.code) {
                return invalid(format!(
                    "transition code '{}' is not lower_snake_case",
                    transition.code
                ));
            }
            for endpoint in [&transition.from_state, &transition.to_state] {
                if !codes.contains(endpoint.as_str()) {
                    return invalid(format!(
                        "transition '{}' references unknown state '{}'",
                        transition.code, endpoint
                    ));
                }
            }
            if !edges.insert((transition.from_state.as_str(), transition.code.as_str())) {
                return invalid(format!(
                    "transition '{}' is defined twice from '{}'",
                    transition.code, transition.from_state
                ));
            }
            if transition.allowed_roles.is_empty() {
                return invalid(format!("transition '{}' allows no roles", transition.code));
            }
            if self
                .state(&transition.from_state)
                .is_some_and(|s| s.is_terminal)
            {
                return invalid(format!(
                    "terminal state '{}' has outgoing transition '{}'",
                    transition.from_state, transition.code
                ));
            }
        }

        let reachable = self.reachable_from(&initial[0].code);
        if let Some(orphan) = self.states.iter().find(|s| !reachable.contains(s.code.as_str())) {
            return invalid(format!(
                "state '{}' is unreachable from '{}'",
                orphan.code, initial[0].code
            ));
        }

        Ok(())
    }

    fn reachable_from<'a>(&'a self, start: &'a str) -> HashSet<&'a str> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for t in &self.transitions {
            adjacency
                .entry(t.from_state.as_str())
                .or_default()
                .push(t.to_state.as_str());
        }

        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(code) = queue.pop_front() {
            for next in adjacency.get(code).into_iter().flatten() {
                if seen.insert(*next) {
                    queue.push_back(*next);
                }
            }
        }
        seen
    }
}
