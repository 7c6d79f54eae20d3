use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::clock::{saturating_days, ClockStatus, SlaClock};
use super::escalation::{due_escalations, EscalationEvent, EscalationSink};
use crate::audit::{self, AuditAction, AuditRecord, AuditSink};
use crate::error::{WorkflowError, WorkflowResult};
use crate::observability::engine_metrics;
use crate::store::{ClockMutation, ClockStore};
use crate::time_source::TimeSource;
use crate::workflow::{EntityKey, EscalationRepeat, EscalationThreshold, WorkflowState};

/// Result of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub evaluated: usize,
    pub fired: Vec<EscalationEvent>,
    pub failures: usize,
}

pub struct SlaService {
    store: Arc<dyn ClockStore>,
    audit: Arc<dyn AuditSink>,
    escalations: Arc<dyn EscalationSink>,
    time: Arc<dyn TimeSource>,
    repeat_interval: Duration,
}

impl SlaService {
    pub fn new(
        store: Arc<dyn ClockStore>,
        audit: Arc<dyn AuditSink>,
        escalations: Arc<dyn EscalationSink>,
        time: Arc<dyn TimeSource>,
        repeat_interval: Duration,
    ) -> Self {
        Self {
            store,
            audit,
            escalations,
            time,
            repeat_interval,
        }
    }

    async fn require_clock(&self, clock_id: Uuid) -> WorkflowResult<SlaClock> {
        self.store
            .get_clock(clock_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("SLA clock", clock_id.to_string()))
    }

    /// Start the clock for `state`. No-op when the state has no SLA.
    pub async fn open_clock(&self, key: &EntityKey, state: &WorkflowState) -> WorkflowResult<Option<SlaClock>> {
        let now = self.time.now();
        let Some(clock) = SlaClock::open(key, state, now)? else {
            return Ok(None);
        };

        // A clock left open by an earlier failure would block the insert.
        if let Some(stale) = self.store.open_clock_for(key).await? {
            warn!(clock_id = %stale.id, entity = %key, state = %stale.state_code, "Closing stale open clock");
            self.close_clock(key).await?;
        }

        let clock = self.store.insert_clock(clock).await?;
        engine_metrics().record_clock_opened();
        info!(
            clock_id = %clock.id,
            entity = %key,
            state = %clock.state_code,
            due_at = %clock.due_at,
            "SLA clock opened"
        );
        Ok(Some(clock))
    }

    /// Close the entity's open clock as MET or BREACHED. Closing when nothing is open is a no-op.
    pub async fn close_clock(&self, key: &EntityKey) -> WorkflowResult<Option<SlaClock>> {
        let Some(open) = self.store.open_clock_for(key).await? else {
            return Ok(None);
        };
        let now = self.time.now();

        let breach_key = EscalationThreshold::OnBreach.key();
        let mark_key = breach_key.clone();
        let mutation: ClockMutation = Box::new(move |clock: &mut SlaClock| {
            if clock.close(now)
                && clock.status == ClockStatus::Breached
                && !clock.has_fired(&mark_key)
                && clock
                    .escalation_rules
                    .iter()
                    .any(|r| r.threshold == EscalationThreshold::OnBreach)
            {
                clock.mark_fired(mark_key, now);
            }
            Ok(())
        });
        let (before, after) = self.store.modify_clock(open.id, mutation).await?;

        if !before.status.is_open() {
            // Another caller closed it first.
            return Ok(Some(after));
        }

        let breached = after.status == ClockStatus::Breached;
        engine_metrics().record_clock_closed(breached);
        info!(
            clock_id = %after.id,
            entity = %key,
            state = %after.state_code,
            status = ?after.status,
            "SLA clock closed"
        );

        if breached && !before.has_fired(&breach_key) && after.has_fired(&breach_key) {
            for rule in after
                .escalation_rules
                .iter()
                .filter(|r| r.threshold == EscalationThreshold::OnBreach)
            {
                self.dispatch(EscalationEvent::new(&after, rule, now)).await;
            }
        }
        Ok(Some(after))
    }

    async fn dispatch(&self, event: EscalationEvent) {
        let clock_id = event.clock_id;
        match self.escalations.dispatch(event).await {
            Ok(()) => engine_metrics().record_escalation(),
            Err(e) => warn!(clock_id = %clock_id, error = %e, "Failed to dispatch SLA escalation"),
        }
    }

    async fn mutate_audited(
        &self,
        clock_id: Uuid,
        action: AuditAction,
        performed_by: &str,
        mutation: ClockMutation,
    ) -> WorkflowResult<SlaClock> {
        let (before, after) = self.store.modify_clock(clock_id, mutation).await?;
        let record = AuditRecord::new(
            performed_by,
            action,
            &after.entity_type,
            &after.entity_id,
            self.time.now(),
        )
        .with_change(Some(&before), Some(&after));
        audit::record(self.audit.as_ref(), record).await;
        Ok(after)
    }

    pub async fn pause(&self, clock_id: Uuid, performed_by: &str) -> WorkflowResult<SlaClock> {
        let now = self.time.now();
        let clock = self
            .mutate_audited(
                clock_id,
                AuditAction::ClockPaused,
                performed_by,
                Box::new(move |c: &mut SlaClock| c.pause(now)),
            )
            .await?;
        info!(clock_id = %clock_id, remaining_secs = clock.remaining(now).num_seconds(), "SLA clock paused");
        Ok(clock)
    }

    pub async fn resume(&self, clock_id: Uuid, performed_by: &str) -> WorkflowResult<SlaClock> {
        let now = self.time.now();
        let clock = self
            .mutate_audited(
                clock_id,
                AuditAction::ClockResumed,
                performed_by,
                Box::new(move |c: &mut SlaClock| c.resume(now)),
            )
            .await?;
        info!(clock_id = %clock_id, due_at = %clock.due_at, "SLA clock resumed");
        Ok(clock)
    }

    pub async fn extend(&self, clock_id: Uuid, additional_days: i64, performed_by: &str) -> WorkflowResult<SlaClock> {
        // Surface NotFound before the mutation error path.
        self.require_clock(clock_id).await?;
        let clock = self
            .mutate_audited(
                clock_id,
                AuditAction::ClockExtended,
                performed_by,
                Box::new(move |c: &mut SlaClock| c.extend(additional_days)),
            )
            .await?;
        info!(clock_id = %clock_id, additional_days, due_at = %clock.due_at, "SLA clock extended");
        Ok(clock)
    }

    pub async fn current(&self, key: &EntityKey) -> WorkflowResult<Option<SlaClock>> {
        self.store.open_clock_for(key).await
    }

    pub async fn history(&self, key: &EntityKey) -> WorkflowResult<Vec<SlaClock>> {
        self.store.clocks_for(key).await
    }

    /// RUNNING clocks within `warning_window_days` of their deadline (or past it)
    /// that have not yet been escalated at `warn:<days>`.
    pub async fn get_approaching_breaches(&self, warning_window_days: i64) -> WorkflowResult<Vec<SlaClock>> {
        let now = self.time.now();
        let window = saturating_days(warning_window_days);
        let threshold_key = EscalationThreshold::DaysBeforeDue {
            days: warning_window_days,
        }
        .key();

        let mut approaching: Vec<SlaClock> = self
            .store
            .all_clocks()
            .await?
            .into_iter()
            .filter(|c| c.status == ClockStatus::Running)
            .filter(|c| c.remaining(now) <= window)
            .filter(|c| !c.has_fired(&threshold_key))
            .collect();
        approaching.sort_by_key(|c| c.due_at);
        Ok(approaching)
    }

    /// Evaluate escalation rules of every RUNNING clock and fire what is due.
    ///
    /// Fired thresholds are recorded on the clock inside the store mutation, so
    /// a rerun (or a concurrent sweeper) never fires a ONCE rule twice.
    pub async fn run_sweep(&self) -> WorkflowResult<SweepReport> {
        let now = self.time.now();
        let repeat_interval = self.repeat_interval;
        let running: Vec<SlaClock> = self
            .store
            .all_clocks()
            .await?
            .into_iter()
            .filter(|c| c.status == ClockStatus::Running)
            .collect();

        let mut report = SweepReport {
            evaluated: running.len(),
            ..Default::default()
        };

        for clock in running {
            if due_escalations(&clock, now, repeat_interval).is_empty() {
                continue;
            }

            let mutation: ClockMutation = Box::new(move |c: &mut SlaClock| {
                let keys: Vec<String> = due_escalations(c, now, repeat_interval)
                    .into_iter()
                    .map(|r| r.threshold.key())
                    .collect();
                for key in keys {
                    c.mark_fired(key, now);
                }
                Ok(())
            });

            let (before, after) = match self.store.modify_clock(clock.id, mutation).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(clock_id = %clock.id, error = %e, "SLA sweep failed for clock");
                    report.failures += 1;
                    continue;
                }
            };

            let newly_fired = after.escalation_rules.iter().filter(|rule| {
                let key = rule.threshold.key();
                after.fired_escalations.get(&key) == Some(&now) && before.fired_escalations.get(&key) != Some(&now)
            });
            for rule in newly_fired {
                let event = EscalationEvent::new(&after, rule, now);
                debug!(
                    clock_id = %after.id,
                    threshold = %event.threshold_key,
                    repeating = rule.repeat == EscalationRepeat::Repeating,
                    "Escalation due"
                );
                report.fired.push(event.clone());
                self.dispatch(event).await;
            }
        }

        if report.failures > 0 {
            engine_metrics().record_sweep_failure();
        }
        info!(
            evaluated = report.evaluated,
            fired = report.fired.len(),
            failures = report.failures,
            "SLA sweep completed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditQuery;
    use crate::sla::escalation::RecordingEscalationSink;
    use crate::store::InMemoryStore;
    use crate::time_source::ManualTimeSource;
    use crate::workflow::definition::fixtures::state;
    use crate::workflow::EscalationRule;
    use chrono::Utc;

    struct Fixture {
        sla: SlaService,
        store: Arc<InMemoryStore>,
        sink: Arc<RecordingEscalationSink>,
        time: ManualTimeSource,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let sink = Arc::new(RecordingEscalationSink::new());
        let time = ManualTimeSource::new(Utc::now());
        let sla = SlaService::new(
            store.clone(),
            store.clone(),
            sink.clone(),
            Arc::new(time.clone()),
            Duration::days(1),
        );
        Fixture { sla, store, sink, time }
    }

    fn key() -> EntityKey {
        EntityKey::new("REVIEW", "rev-1")
    }

    fn submitted_with_rules() -> WorkflowState {
        let mut s = state("SUBMITTED", false, false, Some(5));
        s.escalation_rules = vec![
            EscalationRule {
                threshold: EscalationThreshold::DaysBeforeDue { days: 1 },
                notify: "REVIEW_COORDINATOR".to_string(),
                repeat: EscalationRepeat::Once,
            },
            EscalationRule {
                threshold: EscalationThreshold::OnBreach,
                notify: "ADMIN".to_string(),
                repeat: EscalationRepeat::Once,
            },
        ];
        s
    }

    #[tokio::test]
    async fn test_state_without_sla_opens_nothing() {
        let f = fixture();
        let opened = f.sla.open_clock(&key(), &state("DRAFT", true, false, None)).await.unwrap();
        assert!(opened.is_none());
        assert!(f.sla.current(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let f = fixture();
        f.sla.open_clock(&key(), &submitted_with_rules()).await.unwrap();
        f.time.advance(Duration::days(2));

        let closed = f.sla.close_clock(&key()).await.unwrap().unwrap();
        assert_eq!(closed.status, ClockStatus::Met);
        assert!(f.sla.close_clock(&key()).await.unwrap().is_none());
        assert_eq!(f.sla.history(&key()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_breach_at_close_fires_once() {
        let f = fixture();
        f.sla.open_clock(&key(), &submitted_with_rules()).await.unwrap();
        f.time.advance(Duration::days(6));

        let approaching = f.sla.get_approaching_breaches(0).await.unwrap();
        assert_eq!(approaching.len(), 1);

        let closed = f.sla.close_clock(&key()).await.unwrap().unwrap();
        assert_eq!(closed.status, ClockStatus::Breached);

        let events = f.sink.events().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_breach());
    }

    #[tokio::test]
    async fn test_pause_resume_preserves_remaining_time() {
        let f = fixture();
        let mut s = state("SUBMITTED", false, false, Some(4));
        s.escalation_rules.clear();
        let clock = f.sla.open_clock(&key(), &s).await.unwrap().unwrap();

        f.time.advance(Duration::days(1));
        let paused = f.sla.pause(clock.id, "admin").await.unwrap();
        let remaining_at_pause = paused.remaining(f.time.now());
        assert_eq!(remaining_at_pause, Duration::days(3));

        f.time.advance(Duration::days(2));
        let resumed = f.sla.resume(clock.id, "admin").await.unwrap();
        assert_eq!(resumed.remaining(f.time.now()), Duration::days(3));
        assert_eq!(resumed.total_paused_secs, Duration::days(2).num_seconds());

        let err = f.sla.resume(clock.id, "admin").await.unwrap_err();
        assert!(matches!(err, WorkflowError::ClockStateError { .. }));

        let audits = f
            .store
            .query(&AuditQuery {
                entity_id: Some("rev-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(audits.len(), 2);
    }

    #[tokio::test]
    async fn test_extend_rejects_closed_clock() {
        let f = fixture();
        let clock = f.sla.open_clock(&key(), &submitted_with_rules()).await.unwrap().unwrap();
        let extended = f.sla.extend(clock.id, 2, "admin").await.unwrap();
        assert_eq!(extended.due_at, clock.due_at + Duration::days(2));

        f.sla.close_clock(&key()).await.unwrap();
        let err = f.sla.extend(clock.id, 1, "admin").await.unwrap_err();
        assert!(matches!(err, WorkflowError::ClockStateError { .. }));

        let missing = f.sla.extend(Uuid::new_v4(), 1, "admin").await.unwrap_err();
        assert!(matches!(missing, WorkflowError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_out_of_range_day_inputs_are_rejected_or_clamped() {
        let f = fixture();
        let clock = f.sla.open_clock(&key(), &submitted_with_rules()).await.unwrap().unwrap();

        let err = f.sla.extend(clock.id, i64::MAX / 1000, "admin").await.unwrap_err();
        assert!(matches!(err, WorkflowError::ClockStateError { .. }));
        let unchanged = f.sla.current(&key()).await.unwrap().unwrap();
        assert_eq!(unchanged.due_at, clock.due_at);
        assert!(f.store.query(&AuditQuery::default()).await.unwrap().is_empty());

        // Every running clock is within an unbounded window.
        let wide = f.sla.get_approaching_breaches(i64::MAX).await.unwrap();
        assert_eq!(wide.len(), 1);
        let narrow = f.sla.get_approaching_breaches(i64::MIN).await.unwrap();
        assert!(narrow.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_does_not_double_fire_once_rules() {
        let f = fixture();
        f.sla.open_clock(&key(), &submitted_with_rules()).await.unwrap();
        f.time.advance(Duration::days(4) + Duration::hours(1));

        let first = f.sla.run_sweep().await.unwrap();
        assert_eq!(first.fired.len(), 1);
        assert_eq!(first.fired[0].threshold_key, "warn:1");

        let second = f.sla.run_sweep().await.unwrap();
        assert!(second.fired.is_empty());

        f.time.advance(Duration::days(1));
        let third = f.sla.run_sweep().await.unwrap();
        assert_eq!(third.fired.len(), 1);
        assert!(third.fired[0].is_breach());
        assert_eq!(f.sink.events().await.len(), 2);
    }
}
