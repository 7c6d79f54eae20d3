use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::execution::Actor;
use crate::error::{WorkflowError, WorkflowResult};

/// What a guard sees about the transition being attempted.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardContext {
    pub entity_type: String,
    pub entity_id: String,
    pub organization_id: Option<String>,
    pub current_state: String,
    pub target_state: String,
    pub transition_code: String,
    pub performer: Actor,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    Pass,
    Fail { reason: String },
}

impl GuardVerdict {
    pub fn fail(reason: impl Into<String>) -> Self {
        GuardVerdict::Fail { reason: reason.into() }
    }
}

/// A caller-supplied business precondition, registered under the name used in definitions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GuardCheck: Send + Sync {
    async fn check(&self, ctx: &GuardContext) -> WorkflowResult<GuardVerdict>;
}

#[derive(Default, Clone)]
pub struct GuardRegistry {
    checks: HashMap<String, Arc<dyn GuardCheck>>,
}

impl GuardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, check: Arc<dyn GuardCheck>) {
        self.checks.insert(name.into(), check);
    }

    pub fn with(mut self, name: impl Into<String>, check: Arc<dyn GuardCheck>) -> Self {
        self.register(name, check);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.checks.contains_key(name)
    }

    /// Run the named checks in order; the first failure wins.
    /// A name with no registered check fails closed.
    pub async fn evaluate(&self, names: &[String], ctx: &GuardContext) -> WorkflowResult<()> {
        for name in names {
            let Some(check) = self.checks.get(name) else {
                return Err(WorkflowError::GuardFailed {
                    guard: name.clone(),
                    reason: "no check registered under this name".to_string(),
                });
            };
            match check.check(ctx).await? {
                GuardVerdict::Pass => debug!(guard = %name, "Guard passed"),
                GuardVerdict::Fail { reason } => {
                    return Err(WorkflowError::GuardFailed {
                        guard: name.clone(),
                        reason,
                    })
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for GuardRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.checks.keys().collect();
        names.sort();
        f.debug_struct("GuardRegistry").field("checks", &names).finish()
    }
}
