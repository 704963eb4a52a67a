//! In-memory platform fakes for tests and dry runs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{AppTrigger, LaunchTarget, SharedSetting};
use crate::error::{BootError, Result};

/// A write observed by `MemorySetting`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingOp {
    Put(String, String),
    Delete(String),
}

/// Setting store kept in a map, recording every write.
#[derive(Debug)]
pub struct MemorySetting {
    values: Mutex<HashMap<String, String>>,
    history: Mutex<Vec<SettingOp>>,
    changes: broadcast::Sender<String>,
    fail_writes: AtomicBool,
}

impl Default for MemorySetting {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            values: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            changes,
            fail_writes: AtomicBool::new(false),
        }
    }
}

impl MemorySetting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent puts and deletes fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every write so far, oldest first
    pub fn history(&self) -> Vec<SettingOp> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Synchronous read for assertions
    pub fn value(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned()
    }

    /// Number of live subscriptions
    pub fn listener_count(&self) -> usize {
        self.changes.receiver_count()
    }

    fn check_writable(&self, key: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BootError::ConfigWriteFailure(format!("{key} is read-only")));
        }
        Ok(())
    }
}

#[async_trait]
impl SharedSetting for MemorySetting {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.value(key))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.check_writable(key)?;
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SettingOp::Put(key.to_string(), value.to_string()));
        let _ = self.changes.send(key.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_writable(key)?;
        self.values.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SettingOp::Delete(key.to_string()));
        let _ = self.changes.send(key.to_string());
        Ok(())
    }

    fn subscribe(&self, _key: &str) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }
}

type FireHook = Box<dyn Fn(&LaunchTarget) + Send + Sync>;

/// Trigger that records launches and optionally runs a hook standing in for
/// the daemon's reaction.
pub struct RecordingTrigger {
    target: LaunchTarget,
    fired: Mutex<Vec<LaunchTarget>>,
    on_fire: Option<FireHook>,
    fail_resolve: bool,
}

impl std::fmt::Debug for RecordingTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingTrigger")
            .field("target", &self.target)
            .field("fail_resolve", &self.fail_resolve)
            .finish_non_exhaustive()
    }
}

impl RecordingTrigger {
    pub fn new(target: LaunchTarget) -> Self {
        Self {
            target,
            fired: Mutex::new(Vec::new()),
            on_fire: None,
            fail_resolve: false,
        }
    }

    pub fn on_fire(mut self, hook: impl Fn(&LaunchTarget) + Send + Sync + 'static) -> Self {
        self.on_fire = Some(Box::new(hook));
        self
    }

    pub fn failing_resolve(mut self) -> Self {
        self.fail_resolve = true;
        self
    }

    pub fn fired(&self) -> Vec<LaunchTarget> {
        self.fired.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl AppTrigger for RecordingTrigger {
    async fn resolve(&self) -> Result<LaunchTarget> {
        if self.fail_resolve {
            return Err(BootError::Trigger(format!("Could not find package {}", self.target.package)));
        }
        Ok(self.target.clone())
    }

    async fn fire(&self, target: &LaunchTarget) -> Result<()> {
        self.fired
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(target.clone());
        if let Some(hook) = &self.on_fire {
            hook(target);
        }
        Ok(())
    }
}
