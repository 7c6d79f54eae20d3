// Generic state-graph workflow engine shared by every stateful entity type.

pub mod definition;
pub mod engine;
pub mod execution;
pub mod guards;
pub mod store;

pub use definition::{
    EscalationRepeat, EscalationRule, EscalationThreshold, Role, TransitionGuards, TransitionTrigger,
    WorkflowDefinition, WorkflowState, WorkflowTransition, MAX_SLA_DAYS,
};
pub use engine::{CurrentState, WorkflowEngine};
pub use execution::{
    Actor, EntityKey, HistoryEntry, TransitionOutcome, TransitionRequest, WorkflowEvent, WorkflowExecution,
};
pub use guards::{GuardCheck, GuardContext, GuardRegistry, GuardVerdict};
pub use store::DefinitionStore;
