//! Host platform capabilities.
//!
//! The orchestrator never talks to the OS directly. Global settings and the
//! trigger app are injected through the traits below, with command-backed
//! implementations for a device and in-memory ones for tests.

mod activity;
mod memory;
mod settings;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;

pub use activity::ActivityTrigger;
pub use memory::{MemorySetting, RecordingTrigger, SettingOp};
pub use settings::SettingsCommand;

/// A global string-valued setting store.
#[async_trait]
pub trait SharedSetting: Send + Sync {
    /// Current value, `None` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Remove the key entirely.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Change notifications for `key`. Each message carries the changed key;
    /// the value has to be read back with `get`. Dropping the receiver
    /// unregisters the listener.
    fn subscribe(&self, key: &str) -> broadcast::Receiver<String>;
}

/// An app resolved ahead of time so firing it is a single step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTarget {
    pub package: String,
    pub activity: String,
    /// Installed location reported by the package manager
    pub code_path: Option<String>,
}

impl LaunchTarget {
    pub fn new(package: impl Into<String>, activity: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            activity: activity.into(),
            code_path: None,
        }
    }

    /// `package/activity` form accepted by the activity manager
    pub fn component(&self) -> String {
        format!("{}/{}", self.package, self.activity)
    }
}

/// Starts the app whose launch fires the armed payload.
#[async_trait]
pub trait AppTrigger: Send + Sync {
    /// Look the target up without side effects.
    async fn resolve(&self) -> Result<LaunchTarget>;

    /// Start the resolved target.
    async fn fire(&self, target: &LaunchTarget) -> Result<()>;
}
