// Review Workflow Library - Peer-Review Case Workflow Engine
// This exposes the core components for embedding and integration testing

pub mod analytics;
pub mod audit;
pub mod coi;
pub mod config;
#[cfg(feature = "database")]
pub mod database;
pub mod error;
pub mod observability;
pub mod service;
pub mod shutdown;
pub mod sla;
pub mod store;
pub mod telemetry;
pub mod time_source;
pub mod workflow;

// Re-export key types for easy access
pub use analytics::{AnalyticsFilter, AnalyticsReport, BottleneckSeverity, StateStats, WorkflowAnalytics};
pub use audit::{AuditAction, AuditQuery, AuditRecord, AuditSink};
pub use coi::{
    CoiDetector, CoiGate, CoiOverride, CoiSeverity, CoiType, ConflictReport, OverrideManager, OverrideRequest,
    ReviewerCoi,
};
pub use config::{config, init_config, ReviewWorkflowConfig};
#[cfg(feature = "database")]
pub use database::DatabaseManager;
pub use error::{WorkflowError, WorkflowResult};
pub use observability::{engine_metrics, EngineMetrics, OperationTimer};
pub use service::{CreateOverridePayload, ExecuteTransitionPayload, ReviewWorkflowService, ServiceBuilder, Session};
pub use shutdown::ShutdownCoordinator;
pub use sla::{ClockStatus, EscalationEvent, EscalationSink, SlaClock, SlaService, SlaSweeper};
pub use store::InMemoryStore;
pub use telemetry::{generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use time_source::{ManualTimeSource, SystemTimeSource, TimeSource};
pub use workflow::{
    Actor, DefinitionStore, EntityKey, GuardCheck, GuardRegistry, HistoryEntry, Role, TransitionOutcome,
    TransitionRequest, WorkflowDefinition, WorkflowEngine, WorkflowExecution, WorkflowState, WorkflowTransition,
};
