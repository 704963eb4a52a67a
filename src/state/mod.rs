//! Persistent boot-attempt history.
//!
//! `BootLoopState` is the single source of truth for boot-loop prevention. It is
//! only ever mutated by the guard and is never rebuilt from process state.

mod json;
mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use json::JsonStateStore;
pub use memory::MemoryStateStore;

/// Durable record of launch attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootLoopState {
    /// Attempts since the last recorded success
    pub failure_count: u32,
    /// When the most recent attempt started
    pub last_attempt_time: Option<DateTime<Utc>>,
    /// When the daemon last reported a full start
    pub last_success_time: Option<DateTime<Utc>>,
    /// Circuit breaker is open
    pub launch_disabled: bool,
    /// Single-use bypass of the circuit breaker
    pub manual_override: bool,
}

/// Storage backend for `BootLoopState`.
pub trait StateStore: Send + Sync {
    /// Load the persisted state; a store that was never written yields the default.
    fn load(&self) -> Result<BootLoopState>;

    /// Persist the full state.
    fn save(&self, state: &BootLoopState) -> Result<()>;

    /// Remove every persisted key.
    fn clear(&self) -> Result<()>;
}
