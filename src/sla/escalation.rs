use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use super::clock::{saturating_days, ClockStatus, SlaClock};
use crate::error::WorkflowResult;
use crate::workflow::{EscalationRepeat, EscalationRule, EscalationThreshold};

/// Notification handed to the caller's delivery channel; the engine never sends it itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationEvent {
    pub clock_id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub state_code: String,
    pub threshold_key: String,
    pub notify: String,
    pub due_at: DateTime<Utc>,
    pub remaining_secs: i64,
    pub fired_at: DateTime<Utc>,
}

impl EscalationEvent {
    pub fn new(clock: &SlaClock, rule: &EscalationRule, now: DateTime<Utc>) -> Self {
        Self {
            clock_id: clock.id,
            entity_type: clock.entity_type.clone(),
            entity_id: clock.entity_id.clone(),
            state_code: clock.state_code.clone(),
            threshold_key: rule.threshold.key(),
            notify: rule.notify.clone(),
            due_at: clock.effective_due_at(now),
            remaining_secs: clock.remaining(now).num_seconds(),
            fired_at: now,
        }
    }

    pub fn is_breach(&self) -> bool {
        self.threshold_key == EscalationThreshold::OnBreach.key()
    }
}

#[async_trait]
pub trait EscalationSink: Send + Sync {
    async fn dispatch(&self, event: EscalationEvent) -> WorkflowResult<()>;
}

/// Default sink: escalations surface in the structured log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEscalationSink;

#[async_trait]
impl EscalationSink for TracingEscalationSink {
    async fn dispatch(&self, event: EscalationEvent) -> WorkflowResult<()> {
        warn!(
            clock_id = %event.clock_id,
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            state = %event.state_code,
            threshold = %event.threshold_key,
            notify = %event.notify,
            remaining_secs = event.remaining_secs,
            "SLA escalation"
        );
        Ok(())
    }
}

/// Keeps every dispatched event in memory.
#[derive(Debug, Default)]
pub struct RecordingEscalationSink {
    events: Mutex<Vec<EscalationEvent>>,
}

impl RecordingEscalationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<EscalationEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EscalationSink for RecordingEscalationSink {
    async fn dispatch(&self, event: EscalationEvent) -> WorkflowResult<()> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

fn threshold_reached(clock: &SlaClock, threshold: &EscalationThreshold, now: DateTime<Utc>) -> bool {
    match threshold {
        EscalationThreshold::DaysBeforeDue { days } => clock.remaining(now) <= saturating_days(*days),
        EscalationThreshold::OnBreach => clock.is_overdue(now),
    }
}

/// Rules of a RUNNING clock that should fire at `now`.
///
/// ONCE rules fire a single time per clock. REPEATING rules fire again after
/// `repeat_interval` has passed since they last fired.
pub fn due_escalations<'a>(
    clock: &'a SlaClock,
    now: DateTime<Utc>,
    repeat_interval: Duration,
) -> Vec<&'a EscalationRule> {
    if clock.status != ClockStatus::Running {
        return Vec::new();
    }
    clock
        .escalation_rules
        .iter()
        .filter(|rule| threshold_reached(clock, &rule.threshold, now))
        .filter(|rule| match (rule.repeat, clock.fired_escalations.get(&rule.threshold.key())) {
            (_, None) => true,
            (EscalationRepeat::Once, Some(_)) => false,
            (EscalationRepeat::Repeating, Some(last)) => now - *last >= repeat_interval,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::fixtures::state;
    use crate::workflow::EntityKey;

    fn clock_with(rules: Vec<EscalationRule>, now: DateTime<Utc>) -> SlaClock {
        let mut s = state("IN_REVIEW", false, false, Some(5));
        s.escalation_rules = rules;
        SlaClock::open(&EntityKey::new("REVIEW", "r-1"), &s, now).unwrap().unwrap()
    }

    fn rule(threshold: EscalationThreshold, repeat: EscalationRepeat) -> EscalationRule {
        EscalationRule {
            threshold,
            notify: "ADMIN".to_string(),
            repeat,
        }
    }

    #[test]
    fn test_warning_fires_inside_window_once() {
        let start = Utc::now();
        let mut clock = clock_with(
            vec![rule(EscalationThreshold::DaysBeforeDue { days: 2 }, EscalationRepeat::Once)],
            start,
        );
        assert!(due_escalations(&clock, start + Duration::days(2), Duration::days(1)).is_empty());

        let later = start + Duration::days(3);
        assert_eq!(due_escalations(&clock, later, Duration::days(1)).len(), 1);

        clock.mark_fired("warn:2".to_string(), later);
        assert!(due_escalations(&clock, later + Duration::days(1), Duration::days(1)).is_empty());
    }

    #[test]
    fn test_repeating_breach_respects_interval() {
        let start = Utc::now();
        let mut clock = clock_with(
            vec![rule(EscalationThreshold::OnBreach, EscalationRepeat::Repeating)],
            start,
        );
        let overdue = start + Duration::days(6);
        assert_eq!(due_escalations(&clock, overdue, Duration::days(1)).len(), 1);

        clock.mark_fired("breach".to_string(), overdue);
        assert!(due_escalations(&clock, overdue + Duration::hours(12), Duration::days(1)).is_empty());
        assert_eq!(due_escalations(&clock, overdue + Duration::days(1), Duration::days(1)).len(), 1);
    }

    #[test]
    fn test_paused_clock_never_escalates() {
        let start = Utc::now();
        let mut clock = clock_with(vec![rule(EscalationThreshold::OnBreach, EscalationRepeat::Once)], start);
        clock.pause(start + Duration::days(1)).unwrap();
        assert!(due_escalations(&clock, start + Duration::days(30), Duration::days(1)).is_empty());
    }
}
