//! Drop guard for a payload sitting in the shared setting.

use std::sync::Arc;

use log::{debug, warn};

use crate::platform::SharedSetting;

/// Tracks whether the shared setting may still hold a payload. If the attempt
/// is abandoned while armed, dropping the guard schedules a clear on the
/// current runtime.
pub(crate) struct ArmedSetting {
    settings: Arc<dyn SharedSetting>,
    key: String,
    armed: bool,
}

impl ArmedSetting {
    pub(crate) fn new(settings: Arc<dyn SharedSetting>, key: impl Into<String>) -> Self {
        Self {
            settings,
            key: key.into(),
            armed: false,
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed
    }

    /// Write the payload. The guard counts as armed even when the write
    /// fails, since a partial write cannot be ruled out.
    pub(crate) async fn write(&mut self, value: &str) -> crate::Result<()> {
        self.armed = true;
        self.settings.put(&self.key, value).await?;
        debug!("Armed {} ({} bytes)", self.key, value.len());
        Ok(())
    }

    /// Delete the key. Stays armed if the delete fails.
    pub(crate) async fn clear(&mut self, stage: &str) -> bool {
        match self.settings.delete(&self.key).await {
            Ok(()) => {
                debug!("Cleared {} ({stage})", self.key);
                self.armed = false;
                true
            }
            Err(e) => {
                warn!("Failed to clear {} ({stage}): {e}", self.key);
                false
            }
        }
    }
}

impl Drop for ArmedSetting {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let settings = self.settings.clone();
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = settings.delete(&key).await {
                        warn!("Failed to clear abandoned {key}: {e}");
                    }
                });
            }
            Err(_) => warn!("No runtime to clear abandoned {key}"),
        }
    }
}
