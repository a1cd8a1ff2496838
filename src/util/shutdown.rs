//! Shutdown signalling for background tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Tells background tasks to stop.
///
/// Late subscribers can check [`is_shutdown`](Self::is_shutdown), since a
/// broadcast sent before they subscribed is not replayed.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    fired: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Create a new shutdown signal.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Trigger shutdown. Only the first call notifies.
    pub fn shutdown(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            let _ = self.sender.send(());
        }
    }

    /// Whether shutdown was triggered.
    pub fn is_shutdown(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
