//! Resolve-once handoff between a signal source and its waiter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use super::SignalOutcome;

/// Create a connected resolver/waiter pair.
pub fn once_channel() -> (Resolver, PendingOutcome) {
    let (sender, receiver) = oneshot::channel();
    let resolver = Resolver {
        inner: Arc::new(ResolverInner {
            fired: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
        }),
    };
    (resolver, PendingOutcome { receiver })
}

struct ResolverInner {
    fired: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<SignalOutcome>>>,
}

/// Producer side. Cloneable so that several racing sources (a setup-time check
/// and a listener callback, say) can share it; only the first `resolve` wins.
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<ResolverInner>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

impl Resolver {
    /// Deliver `outcome` unless something already did. Returns whether this call won.
    pub fn resolve(&self, outcome: SignalOutcome) -> bool {
        if self.inner.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        let sender = self
            .inner
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(sender) = sender {
            // The waiter may already have timed out and gone away
            let _ = sender.send(outcome);
        }
        true
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }
}

/// Waiter side of a `once_channel`.
#[derive(Debug)]
pub struct PendingOutcome {
    receiver: oneshot::Receiver<SignalOutcome>,
}

impl PendingOutcome {
    /// Wait up to `timeout` for the outcome. Every resolver being dropped without
    /// resolving counts as a failure.
    pub async fn wait(self, timeout: Duration) -> SignalOutcome {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => SignalOutcome::Failure,
            Err(_) => SignalOutcome::Timeout,
        }
    }
}
