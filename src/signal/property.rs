//! Out-of-band property watcher.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::{PendingOutcome, Resolver, SignalOutcome, SignalWatcher, once_channel};
use crate::error::Result;
use crate::platform::SharedSetting;

/// Value written by the daemon once it is fully up
pub const STATUS_SUCCESS: &str = "success";

/// Value written by the daemon when startup failed
pub const STATUS_FAILURE: &str = "failure";

/// Watches a shared setting key for the daemon's status report.
pub struct PropertyWatcher {
    settings: Arc<dyn SharedSetting>,
    key: String,
    listener: Option<JoinHandle<()>>,
    pending: Option<PendingOutcome>,
}

impl std::fmt::Debug for PropertyWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyWatcher")
            .field("key", &self.key)
            .field("armed", &self.listener.is_some())
            .finish_non_exhaustive()
    }
}

impl PropertyWatcher {
    pub fn new(settings: Arc<dyn SharedSetting>, key: impl Into<String>) -> Self {
        Self {
            settings,
            key: key.into(),
            listener: None,
            pending: None,
        }
    }
}

fn parse_status(value: &str) -> Option<SignalOutcome> {
    match value.trim() {
        STATUS_SUCCESS => Some(SignalOutcome::Success),
        STATUS_FAILURE => Some(SignalOutcome::Failure),
        _ => None,
    }
}

/// Read the key and resolve on a recognised value. Returns whether the watch is done.
async fn check(settings: &dyn SharedSetting, key: &str, resolver: &Resolver) -> bool {
    match settings.get(key).await {
        Ok(Some(value)) => match parse_status(&value) {
            Some(outcome) => {
                info!("Property {key} reported {outcome}");
                resolver.resolve(outcome);
                true
            }
            None => {
                debug!("Ignoring {key}={value:?}");
                false
            }
        },
        Ok(None) => false,
        Err(e) => {
            warn!("Failed to read {key}: {e}");
            false
        }
    }
}

#[async_trait]
impl SignalWatcher for PropertyWatcher {
    fn name(&self) -> &str {
        "property"
    }

    async fn reset(&mut self) -> Result<()> {
        self.settings.put(&self.key, "").await?;
        debug!("Cleared {}", self.key);
        Ok(())
    }

    async fn arm(&mut self) -> Result<()> {
        self.cancel();

        let mut changes = self.settings.subscribe(&self.key);
        let (resolver, pending) = once_channel();
        let settings = self.settings.clone();
        let key = self.key.clone();

        let listener = tokio::spawn(async move {
            // Catch a value written before the subscription was registered
            if check(settings.as_ref(), &key, &resolver).await {
                return;
            }
            loop {
                match changes.recv().await {
                    Ok(changed) if changed == key => {
                        if check(settings.as_ref(), &key, &resolver).await {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        debug!("Missed {missed} change notifications for {key}");
                        if check(settings.as_ref(), &key, &resolver).await {
                            return;
                        }
                    }
                    Err(RecvError::Closed) => {
                        warn!("Change notifications for {key} closed");
                        return;
                    }
                }
            }
        });

        self.listener = Some(listener);
        self.pending = Some(pending);
        Ok(())
    }

    fn take_pending(&mut self) -> Option<PendingOutcome> {
        self.pending.take()
    }

    fn cancel(&mut self) {
        self.pending = None;
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl Drop for PropertyWatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}
