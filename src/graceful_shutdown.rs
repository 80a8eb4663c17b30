use tokio::sync::watch;
use tracing::debug;

/// Graceful shutdown coordinator
///
/// One `GracefulShutdown` belongs to each listener. Every task the listener
/// spawns holds a `ShutdownListener`; triggering the coordinator wakes all of
/// them, including those that subscribed after the trigger.
#[derive(Debug)]
pub struct GracefulShutdown {
    shutdown_tx: watch::Sender<bool>,
    name: &'static str,
}

/// Receiving half handed to spawned tasks
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    shutdown_rx: watch::Receiver<bool>,
}

impl GracefulShutdown {
    pub fn new(name: &'static str) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self { shutdown_tx, name }
    }

    /// Get a shutdown receiver for components to listen on
    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            shutdown_rx: self.shutdown_tx.subscribe(),
        }
    }

    /// Signal every subscriber. Returns false if already triggered.
    pub fn trigger(&self) -> bool {
        let first = self.shutdown_tx.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        });
        if first {
            debug!("{}: shutdown signalled", self.name);
        }
        first
    }

    pub fn is_triggered(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

impl ShutdownListener {
    /// Resolves once shutdown has been triggered (immediately if it already was)
    pub async fn wait(&mut self) {
        // Err means the coordinator is gone, which is shutdown as well
        let _ = self.shutdown_rx.wait_for(|stopped| *stopped).await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}
