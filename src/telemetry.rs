use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;

/// Install the global subscriber: JSON or plain fmt output filtered by `RUST_LOG`,
/// falling back to the configured level.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let registry = tracing_subscriber::registry().with(filter);
    if config.json_logs {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }

    tracing::info!("Review workflow telemetry initialized with structured logging");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span for one RPC call made on behalf of a session
pub fn create_request_span(operation: &str, actor_id: &str, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        operation = operation,
        actor.id = actor_id,
        correlation.id = correlation_id
    )
}

/// Flush final metrics before exit
pub fn shutdown_telemetry(config: &ObservabilityConfig) {
    if config.metrics_enabled {
        crate::observability::engine_metrics().log_stats();
    }
    tracing::info!("Review workflow telemetry shutdown complete");
}
