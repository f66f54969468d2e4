//! Graceful shutdown handling
//!
//! Broadcast-based shutdown signalling for background tasks: heartbeat
//! loops, the watch dispatcher and the tree server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Shutdown signal broadcaster
///
/// Tasks call [`subscribe`](Self::subscribe) before they start; clones share
/// the same signal.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<broadcast::Sender<()>>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender: Arc::new(sender),
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Trigger shutdown; later calls are no-ops
    pub fn shutdown(&self) {
        if !self.triggered.swap(true, Ordering::SeqCst) {
            let _ = self.sender.send(());
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Resolve once shutdown has been triggered, even if that happened
    /// before this call
    pub async fn wait(&self) {
        let mut receiver = self.subscribe();
        if self.is_triggered() {
            return;
        }
        let _ = receiver.recv().await;
    }

    /// Trigger shutdown on Ctrl-C
    pub fn trigger_on_ctrl_c(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, shutting down");
                signal.shutdown();
            }
        });
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_signal() {
        let signal = ShutdownSignal::new();
        let mut receiver = signal.subscribe();

        let handle = tokio::spawn(async move {
            let _ = receiver.recv().await;
            42
        });

        signal.shutdown();
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_wait_after_trigger_returns() {
        let signal = ShutdownSignal::new();
        signal.shutdown();
        signal.shutdown();
        tokio::time::timeout(Duration::from_millis(100), signal.wait())
            .await
            .unwrap();
    }
}
