use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

use crate::error::WorkflowError;

/// Engine-wide counters
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub transitions_applied: AtomicU64,
    pub transitions_rejected: AtomicU64,
    pub state_conflicts: AtomicU64,
    pub coi_blocks: AtomicU64,
    pub clocks_opened: AtomicU64,
    pub clocks_met: AtomicU64,
    pub clocks_breached: AtomicU64,
    pub escalations_fired: AtomicU64,
    pub sweep_failures: AtomicU64,
    pub audit_failures: AtomicU64,
    pub definition_cache_hits: AtomicU64,
    pub definition_cache_misses: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_transition(&self) {
        self.transitions_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self, error: &WorkflowError) {
        self.transitions_rejected.fetch_add(1, Ordering::Relaxed);
        match error {
            WorkflowError::StateConflict { .. } => {
                self.state_conflicts.fetch_add(1, Ordering::Relaxed);
            }
            WorkflowError::ConflictOfInterest { .. } => {
                self.coi_blocks.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_clock_opened(&self) {
        self.clocks_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_clock_closed(&self, breached: bool) {
        if breached {
            self.clocks_breached.fetch_add(1, Ordering::Relaxed);
        } else {
            self.clocks_met.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_escalation(&self) {
        self.escalations_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sweep_failure(&self) {
        self.sweep_failures.fetch_add(1, Ordering::Relaxed);
        warn!("SLA sweep tick failed");
    }

    pub fn record_audit_failure(&self) {
        self.audit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.definition_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.definition_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> EngineStats {
        EngineStats {
            transitions_applied: self.transitions_applied.load(Ordering::Relaxed),
            transitions_rejected: self.transitions_rejected.load(Ordering::Relaxed),
            state_conflicts: self.state_conflicts.load(Ordering::Relaxed),
            coi_blocks: self.coi_blocks.load(Ordering::Relaxed),
            clocks_opened: self.clocks_opened.load(Ordering::Relaxed),
            clocks_met: self.clocks_met.load(Ordering::Relaxed),
            clocks_breached: self.clocks_breached.load(Ordering::Relaxed),
            escalations_fired: self.escalations_fired.load(Ordering::Relaxed),
            sweep_failures: self.sweep_failures.load(Ordering::Relaxed),
            audit_failures: self.audit_failures.load(Ordering::Relaxed),
            definition_cache_hits: self.definition_cache_hits.load(Ordering::Relaxed),
            definition_cache_misses: self.definition_cache_misses.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            transitions = stats.transitions_applied,
            rejected = stats.transitions_rejected,
            state_conflicts = stats.state_conflicts,
            coi_blocks = stats.coi_blocks,
            clocks_met = stats.clocks_met,
            clocks_breached = stats.clocks_breached,
            escalations = stats.escalations_fired,
            audit_failures = stats.audit_failures,
            cache_hits = stats.definition_cache_hits,
            cache_misses = stats.definition_cache_misses,
            "Workflow engine metrics"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub transitions_applied: u64,
    pub transitions_rejected: u64,
    pub state_conflicts: u64,
    pub coi_blocks: u64,
    pub clocks_opened: u64,
    pub clocks_met: u64,
    pub clocks_breached: u64,
    pub escalations_fired: u64,
    pub sweep_failures: u64,
    pub audit_failures: u64,
    pub definition_cache_hits: u64,
    pub definition_cache_misses: u64,
}

/// Global metrics instance
static ENGINE_METRICS: std::sync::LazyLock<EngineMetrics> = std::sync::LazyLock::new(EngineMetrics::new);

pub fn engine_metrics() -> &'static EngineMetrics {
    &ENGINE_METRICS
}

/// Span wrapping every operation on one entity
pub fn create_entity_span(operation: &str, entity_type: &str, entity_id: &str) -> tracing::Span {
    tracing::info_span!(
        "workflow",
        operation = operation,
        entity_type = entity_type,
        entity_id = entity_id
    )
}

/// Time an operation and log its duration
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        tracing::debug!(
            operation = %self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
