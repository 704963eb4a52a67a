//! Completion signal watchers
//!
//! Three interchangeable ways of learning that the daemon came up:
//! - **Log stream**: match a line in a subprocess's output
//! - **Marker**: a file created in a status directory
//! - **Property**: a shared setting flipped to `success` or `failure`
//!
//! Each watcher resolves at most once per `arm` and releases its listener when
//! it resolves, times out, or is cancelled.

mod log_stream;
mod marker;
mod once;
mod property;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;

use crate::error::{BootError, Result};

pub use log_stream::LogStreamWatcher;
pub use marker::MarkerWatcher;
pub use once::{PendingOutcome, Resolver, once_channel};
pub use property::{PropertyWatcher, STATUS_FAILURE, STATUS_SUCCESS};

/// Result of one watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Success,
    Failure,
    Timeout,
}

impl SignalOutcome {
    /// Map a non-success outcome into the error taxonomy.
    pub fn into_result(self, source: &str) -> Result<()> {
        match self {
            SignalOutcome::Success => Ok(()),
            SignalOutcome::Failure => Err(BootError::SignalFailure(source.to_string())),
            SignalOutcome::Timeout => Err(BootError::SignalTimeout(source.to_string())),
        }
    }
}

impl fmt::Display for SignalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalOutcome::Success => write!(f, "success"),
            SignalOutcome::Failure => write!(f, "failure"),
            SignalOutcome::Timeout => write!(f, "timeout"),
        }
    }
}

/// Common contract of every completion source.
#[async_trait]
pub trait SignalWatcher: Send {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Put the signal source into a neutral state so stale signals are not read.
    async fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    /// Register the listener. Signals seen from here on resolve the watch.
    async fn arm(&mut self) -> Result<()>;

    /// Hand over the pending resolution created by `arm`.
    fn take_pending(&mut self) -> Option<PendingOutcome>;

    /// Unregister the listener and release its resources.
    fn cancel(&mut self);

    /// Wait for the outcome, arming first if needed. The listener is always
    /// released before this returns.
    async fn wait(&mut self, timeout: Duration) -> SignalOutcome {
        let pending = match self.take_pending() {
            Some(pending) => Some(pending),
            None => match self.arm().await {
                Ok(()) => self.take_pending(),
                Err(e) => {
                    warn!("Failed to arm {} watcher: {e}", self.name());
                    None
                }
            },
        };

        let outcome = match pending {
            Some(pending) => pending.wait(timeout).await,
            None => SignalOutcome::Failure,
        };
        self.cancel();
        outcome
    }
}
