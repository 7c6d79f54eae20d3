// Deadline tracking per workflow state, escalation firing and the background sweep.

pub mod clock;
pub mod escalation;
pub mod service;
pub mod sweep;

pub use clock::{ClockStatus, SlaClock};
pub use escalation::{EscalationEvent, EscalationSink, RecordingEscalationSink, TracingEscalationSink};
pub use service::{SlaService, SweepReport};
pub use sweep::SlaSweeper;
