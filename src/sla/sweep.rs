use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use super::service::{SlaService, SweepReport};
use crate::error::WorkflowResult;
use crate::observability::engine_metrics;

/// Periodic background job driving `SlaService::run_sweep`.
///
/// A failed tick is logged and left to the next one, which re-reads current data.
pub struct SlaSweeper {
    service: Arc<SlaService>,
    period: Duration,
}

impl SlaSweeper {
    pub fn new(service: Arc<SlaService>, period: Duration) -> Self {
        Self { service, period }
    }

    pub async fn tick(&self) -> WorkflowResult<SweepReport> {
        self.service.run_sweep().await
    }

    /// Run until `shutdown` flips to `true`. Returns the number of completed ticks.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> u64 {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = 0u64;

        info!(period_secs = self.period.as_secs(), "SLA sweeper started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(_) => ticks += 1,
                        Err(e) => {
                            engine_metrics().record_sweep_failure();
                            warn!(error = %e, "SLA sweep tick failed; retrying next tick");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(ticks, "SLA sweeper stopped");
        ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sla::escalation::TracingEscalationSink;
    use crate::store::InMemoryStore;
    use crate::time_source::SystemTimeSource;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_on_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        let service = Arc::new(SlaService::new(
            store.clone(),
            store,
            Arc::new(TracingEscalationSink),
            Arc::new(SystemTimeSource),
            chrono::Duration::days(1),
        ));
        let sweeper = SlaSweeper::new(service, Duration::from_secs(60));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { sweeper.run(rx).await });
        tokio::time::sleep(Duration::from_secs(150)).await;
        tx.send(true).unwrap();

        let ticks = handle.await.unwrap();
        assert!(ticks >= 2);
    }
}
