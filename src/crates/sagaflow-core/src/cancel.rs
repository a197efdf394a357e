//! Cooperative cancellation
//!
//! A [`CancelToken`] is threaded from the executor's call site through every
//! blocking call. Cancellation is cooperative: the in-flight step gets a
//! chance to observe the token and finish its cancellation response, then
//! the flow transitions to `Cancelled` and any open compensation scope
//! unwinds.

use tokio::sync::watch;

/// Cloneable cancellation token backed by a watch channel
///
/// Clones observe the same cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Signal cancellation to every clone
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether cancellation has been signalled
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once cancellation is signalled
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
