//! External stop signal for a run

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable handle that cancels a run
///
/// Stopping is one-way: once stopped, a handle stays stopped.
#[derive(Debug, Clone)]
pub struct StopHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Request cancellation
    pub fn stop(&self) {
        self.sender.send_if_modified(|stopped| !std::mem::replace(stopped, true));
    }

    pub fn is_stopped(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once the handle is stopped
    pub async fn stopped(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so this only errors on drop
        let _ = receiver.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn stop_wakes_waiters() {
        let handle = StopHandle::new();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.stopped().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_stopped());
        handle.stop();

        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn stopped_returns_immediately_once_stopped() {
        let handle = StopHandle::new();
        handle.stop();
        handle.stop();
        tokio::time::timeout(Duration::from_millis(100), handle.stopped()).await.unwrap();
    }
}
