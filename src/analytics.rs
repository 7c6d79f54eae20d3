// Read-only reporting over history rows and closed SLA clocks.
// Nothing here writes back to the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::error::WorkflowResult;
use crate::sla::{ClockStatus, SlaClock};
use crate::store::{ClockStore, ExecutionStore};
use crate::time_source::TimeSource;
use crate::workflow::{EntityKey, HistoryEntry, WorkflowExecution};

/// States slower than this many seconds on average are reported even without breaches.
const SLOW_STATE_SECS: f64 = 3.0 * 86_400.0;
const MAX_BOTTLENECKS: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsFilter {
    /// Published definition, e.g. `REVIEW@2`.
    pub definition_id: Option<String>,
    pub entity_type: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

impl AnalyticsFilter {
    fn in_range(&self, at: DateTime<Utc>) -> bool {
        self.date_from.is_none_or(|from| at >= from) && self.date_to.is_none_or(|to| at <= to)
    }

    fn matches_execution(&self, execution: &WorkflowExecution) -> bool {
        self.entity_type.as_ref().is_none_or(|t| *t == execution.entity_type)
            && self
                .definition_id
                .as_ref()
                .is_none_or(|id| *id == execution.definition_id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BottleneckSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl BottleneckSeverity {
    fn from_breach_rate(rate: f64) -> Self {
        if rate >= 0.5 {
            BottleneckSeverity::Critical
        } else if rate >= 0.25 {
            BottleneckSeverity::High
        } else if rate > 0.1 {
            BottleneckSeverity::Medium
        } else {
            BottleneckSeverity::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateStats {
    pub entity_type: String,
    pub state_code: String,
    /// Transitions that left this state within the date range.
    pub transitions_out: u64,
    pub avg_duration_in_state_secs: Option<f64>,
    pub clocks_met: u64,
    pub clocks_breached: u64,
    pub breach_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateBottleneck {
    pub entity_type: String,
    pub state_code: String,
    pub severity: BottleneckSeverity,
    pub avg_duration_in_state_secs: f64,
    pub breach_rate: Option<f64>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsReport {
    pub generated_at: DateTime<Utc>,
    pub filter: AnalyticsFilter,
    /// Entity type -> current state -> number of executions sitting in it.
    pub state_distribution: BTreeMap<String, BTreeMap<String, u64>>,
    pub states: Vec<StateStats>,
    /// Slowest states first.
    pub bottlenecks: Vec<StateBottleneck>,
}

#[derive(Default)]
struct Accumulator {
    transitions_out: u64,
    total_duration_secs: i64,
    clocks_met: u64,
    clocks_breached: u64,
}

pub struct WorkflowAnalytics {
    executions: Arc<dyn ExecutionStore>,
    clocks: Arc<dyn ClockStore>,
    time: Arc<dyn TimeSource>,
}

impl WorkflowAnalytics {
    pub fn new(executions: Arc<dyn ExecutionStore>, clocks: Arc<dyn ClockStore>, time: Arc<dyn TimeSource>) -> Self {
        Self {
            executions,
            clocks,
            time,
        }
    }

    async fn scoped_executions(&self, filter: &AnalyticsFilter) -> WorkflowResult<Vec<WorkflowExecution>> {
        Ok(self
            .executions
            .list_executions(filter.entity_type.as_deref())
            .await?
            .into_iter()
            .filter(|e| filter.matches_execution(e))
            .collect())
    }

    /// Per-state counts and average time in state.
    pub async fn get_stats(&self, filter: &AnalyticsFilter) -> WorkflowResult<Vec<StateStats>> {
        let executions = self.scoped_executions(filter).await?;
        let keys: HashSet<EntityKey> = executions.iter().map(WorkflowExecution::key).collect();

        let history: Vec<HistoryEntry> = self
            .executions
            .all_history(filter.entity_type.as_deref())
            .await?
            .into_iter()
            .filter(|h| filter.in_range(h.performed_at))
            .filter(|h| keys.contains(&EntityKey::new(&h.entity_type, &h.entity_id)))
            .collect();

        let clocks: Vec<SlaClock> = self
            .clocks
            .all_clocks()
            .await?
            .into_iter()
            .filter(|c| c.closed_at.is_some_and(|at| filter.in_range(at)))
            .filter(|c| keys.contains(&c.key()))
            .collect();

        let mut by_state: BTreeMap<(String, String), Accumulator> = BTreeMap::new();
        for entry in &history {
            let acc = by_state
                .entry((entry.entity_type.clone(), entry.from_state.clone()))
                .or_default();
            acc.transitions_out += 1;
            acc.total_duration_secs += entry.duration_in_state_secs;
        }
        for clock in &clocks {
            let acc = by_state
                .entry((clock.entity_type.clone(), clock.state_code.clone()))
                .or_default();
            match clock.status {
                ClockStatus::Met => acc.clocks_met += 1,
                ClockStatus::Breached => acc.clocks_breached += 1,
                ClockStatus::Running | ClockStatus::Paused => {}
            }
        }

        Ok(by_state
            .into_iter()
            .map(|((entity_type, state_code), acc)| {
                let closed = acc.clocks_met + acc.clocks_breached;
                StateStats {
                    entity_type,
                    state_code,
                    transitions_out: acc.transitions_out,
                    avg_duration_in_state_secs: (acc.transitions_out > 0)
                        .then(|| acc.total_duration_secs as f64 / acc.transitions_out as f64),
                    clocks_met: acc.clocks_met,
                    clocks_breached: acc.clocks_breached,
                    breach_rate: (closed > 0).then(|| acc.clocks_breached as f64 / closed as f64),
                }
            })
            .collect())
    }

    pub async fn workflow_analytics(&self, filter: AnalyticsFilter) -> WorkflowResult<AnalyticsReport> {
        let mut state_distribution: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for execution in self.scoped_executions(&filter).await? {
            *state_distribution
                .entry(execution.entity_type)
                .or_default()
                .entry(execution.current_state)
                .or_insert(0) += 1;
        }

        let states = self.get_stats(&filter).await?;
        let bottlenecks = identify_bottlenecks(&states);

        Ok(AnalyticsReport {
            generated_at: self.time.now(),
            filter,
            state_distribution,
            states,
            bottlenecks,
        })
    }
}

/// Rank states by average dwell time; severity follows the SLA breach rate.
fn identify_bottlenecks(states: &[StateStats]) -> Vec<StateBottleneck> {
    let mut bottlenecks: Vec<StateBottleneck> = states
        .iter()
        .filter_map(|s| {
            let avg = s.avg_duration_in_state_secs?;
            let rate = s.breach_rate.unwrap_or(0.0);
            if rate <= 0.0 && avg < SLOW_STATE_SECS {
                return None;
            }
            Some(StateBottleneck {
                entity_type: s.entity_type.clone(),
                state_code: s.state_code.clone(),
                severity: BottleneckSeverity::from_breach_rate(rate),
                avg_duration_in_state_secs: avg,
                breach_rate: s.breach_rate,
                description: format!(
                    "{}/{} averages {:.1} days in state ({} of {} clocks breached)",
                    s.entity_type,
                    s.state_code,
                    avg / 86_400.0,
                    s.clocks_breached,
                    s.clocks_met + s.clocks_breached
                ),
            })
        })
        .collect();

    bottlenecks.sort_by(|a, b| b.avg_duration_in_state_secs.total_cmp(&a.avg_duration_in_state_secs));
    bottlenecks.truncate(MAX_BOTTLENECKS);
    bottlenecks
}
