use anyhow::Result;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

/// Graceful shutdown coordinator for background jobs
pub struct ShutdownCoordinator {
    sender: watch::Sender<bool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// Receiver handed to each background job
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    pub fn trigger(&self) {
        info!("Initiating graceful shutdown");
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Wait for Ctrl-C, then signal every subscriber
    pub async fn wait_for_signal(&self) -> Result<()> {
        info!("Shutdown coordinator ready - will shutdown gracefully on Ctrl-C");
        tokio::signal::ctrl_c().await?;
        self.trigger();
        Ok(())
    }

    /// Wait up to `grace` for a job to finish after shutdown was triggered
    pub async fn drain<T>(handle: tokio::task::JoinHandle<T>, grace: Duration) -> Option<T> {
        match timeout(grace, handle).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!("Background job ended abnormally: {}", e);
                None
            }
            Err(_) => {
                warn!("Timeout waiting for background job to stop");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_reaches_subscribers() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();
        assert!(!coordinator.is_triggered());

        let waiter = tokio::spawn(async move {
            rx.changed().await.unwrap();
            *rx.borrow()
        });
        coordinator.trigger();

        let seen = ShutdownCoordinator::drain(waiter, Duration::from_secs(1)).await;
        assert_eq!(seen, Some(true));
    }
}
