// SLA clock lifecycle: RUNNING -> {PAUSED, MET, BREACHED}; PAUSED -> RUNNING.
// MET and BREACHED are terminal for a clock instance.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{WorkflowError, WorkflowResult};
use crate::workflow::{EntityKey, EscalationRule, WorkflowState, MAX_SLA_DAYS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClockStatus {
    Running,
    Paused,
    Met,
    Breached,
}

impl ClockStatus {
    pub fn is_open(self) -> bool {
        matches!(self, ClockStatus::Running | ClockStatus::Paused)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaClock {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub state_code: String,
    pub started_at: DateTime<Utc>,
    /// Already shifted forward by completed pauses and extensions.
    pub due_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub total_paused_secs: i64,
    pub status: ClockStatus,
    pub closed_at: Option<DateTime<Utc>>,
    /// Snapshot of the state's rules when the clock opened.
    pub escalation_rules: Vec<EscalationRule>,
    /// Threshold key -> last time it fired.
    pub fired_escalations: BTreeMap<String, DateTime<Utc>>,
}

/// `at + days`, or `None` when either step leaves chrono's range.
pub(crate) fn add_days(at: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
    at.checked_add_signed(Duration::try_days(days)?)
}

/// `days` as a span, clamped to chrono's range.
pub(crate) fn saturating_days(days: i64) -> Duration {
    Duration::try_days(days).unwrap_or(if days < 0 { Duration::MIN } else { Duration::MAX })
}

impl SlaClock {
    /// `None` when the state defines no SLA.
    pub fn open(key: &EntityKey, state: &WorkflowState, now: DateTime<Utc>) -> WorkflowResult<Option<Self>> {
        let Some(days) = state.sla_days else {
            return Ok(None);
        };
        let due_at = add_days(now, days).ok_or_else(|| WorkflowError::InvalidDefinition {
            reason: format!("state '{}' has an SLA of {days} days", state.code),
        })?;
        Ok(Some(Self {
            id: Uuid::new_v4(),
            entity_type: key.entity_type.clone(),
            entity_id: key.entity_id.clone(),
            state_code: state.code.clone(),
            started_at: now,
            due_at,
            paused_at: None,
            total_paused_secs: 0,
            status: ClockStatus::Running,
            closed_at: None,
            escalation_rules: state.escalation_rules.clone(),
            fired_escalations: BTreeMap::new(),
        }))
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_type, &self.entity_id)
    }

    /// Deadline as of `now`, counting an in-progress pause.
    pub fn effective_due_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match (self.status, self.paused_at) {
            (ClockStatus::Paused, Some(paused_at)) => self
                .due_at
                .checked_add_signed(now - paused_at)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            _ => self.due_at,
        }
    }

    /// Time left before the deadline; frozen while paused, negative once overdue.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        match (self.status, self.paused_at) {
            (ClockStatus::Paused, Some(paused_at)) => self.due_at - paused_at,
            _ => self.due_at - now,
        }
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now > self.effective_due_at(now)
    }

    fn state_error(&self, operation: &'static str) -> WorkflowError {
        WorkflowError::ClockStateError {
            clock_id: self.id.to_string(),
            status: self.status,
            operation,
        }
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> WorkflowResult<()> {
        if self.status != ClockStatus::Running {
            return Err(self.state_error("pause"));
        }
        self.status = ClockStatus::Paused;
        self.paused_at = Some(now);
        Ok(())
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> WorkflowResult<()> {
        if self.status != ClockStatus::Paused {
            return Err(self.state_error("resume"));
        }
        self.settle_pause(now);
        self.status = ClockStatus::Running;
        Ok(())
    }

    pub fn extend(&mut self, additional_days: i64) -> WorkflowResult<()> {
        if !self.status.is_open() {
            return Err(self.state_error("extend"));
        }
        if additional_days <= 0 {
            return Err(self.state_error("extend by a non-positive number of days"));
        }
        if additional_days > MAX_SLA_DAYS {
            return Err(self.state_error("extend by more than the maximum SLA"));
        }
        self.due_at = add_days(self.due_at, additional_days)
            .ok_or_else(|| self.state_error("extend past the latest representable deadline"))?;
        Ok(())
    }

    /// Close on state exit. Returns `false` if the clock was already closed.
    pub fn close(&mut self, now: DateTime<Utc>) -> bool {
        if !self.status.is_open() {
            return false;
        }
        if self.status == ClockStatus::Paused {
            self.settle_pause(now);
        }
        self.status = if now <= self.due_at {
            ClockStatus::Met
        } else {
            ClockStatus::Breached
        };
        self.closed_at = Some(now);
        true
    }

    fn settle_pause(&mut self, now: DateTime<Utc>) {
        if let Some(paused_at) = self.paused_at.take() {
            let paused = now - paused_at;
            self.due_at = self.due_at.checked_add_signed(paused).unwrap_or(DateTime::<Utc>::MAX_UTC);
            self.total_paused_secs = self.total_paused_secs.saturating_add(paused.num_seconds());
        }
    }

    pub fn has_fired(&self, threshold_key: &str) -> bool {
        self.fired_escalations.contains_key(threshold_key)
    }

    pub fn mark_fired(&mut self, threshold_key: String, at: DateTime<Utc>) {
        self.fired_escalations.insert(threshold_key, at);
    }

    /// Wall-clock time spent in the state, excluding pauses.
    pub fn active_duration(&self, now: DateTime<Utc>) -> Duration {
        let end = self.closed_at.unwrap_or(now);
        let mut paused = Duration::seconds(self.total_paused_secs);
        if let Some(paused_at) = self.paused_at {
            paused += end - paused_at;
        }
        (end - self.started_at) - paused
    }
}
