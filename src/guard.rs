//! Boot-loop circuit breaker
//!
//! Every boot counts as a failure until the daemon proves otherwise. After
//! `MAX_FAILURES` unproven attempts the guard refuses further automatic launches
//! until the disabled window passes or an operator sets the manual override.

use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::state::{BootLoopState, StateStore};

/// Consecutive failed attempts before launching is disabled
pub const MAX_FAILURES: u32 = 5;

/// Seconds after the last attempt before a disabled launch re-enables itself
pub const LAUNCH_DISABLED_TIMEOUT_S: i64 = 60 * 60;

/// Outcome of asking whether a launch may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchDecision {
    /// Normal launch
    Allowed,
    /// Circuit breaker is open
    Blocked,
    /// Circuit breaker bypassed by a consumed manual override
    OverrideForced,
}

impl LaunchDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, LaunchDecision::Blocked)
    }
}

/// Tunables for the circuit breaker
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub max_failures: u32,
    pub disabled_timeout: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_failures: MAX_FAILURES,
            disabled_timeout: Duration::seconds(LAUNCH_DISABLED_TIMEOUT_S),
        }
    }
}

/// Persisted failure-counting gate in front of every automatic launch.
pub struct BootLoopGuard {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    config: GuardConfig,
    // Serializes load-modify-save against the store
    critical: Mutex<()>,
}

impl std::fmt::Debug for BootLoopGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootLoopGuard")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BootLoopGuard {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(store, clock, GuardConfig::default())
    }

    pub fn with_config(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, config: GuardConfig) -> Self {
        Self {
            store,
            clock,
            config,
            critical: Mutex::new(()),
        }
    }

    /// Run `f` on the persisted state inside the critical section and save the result.
    fn update<T>(&self, f: impl FnOnce(&mut BootLoopState, DateTime<Utc>) -> T) -> Result<T> {
        let _guard = self.critical.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = self.store.load()?;
        let value = f(&mut state, self.clock.now());
        self.store.save(&state)?;
        Ok(value)
    }

    fn disabled_window_elapsed(&self, state: &BootLoopState, now: DateTime<Utc>) -> bool {
        match state.last_attempt_time {
            Some(last) => now - last > self.config.disabled_timeout,
            None => true,
        }
    }

    /// Decide whether this boot may attempt a launch.
    ///
    /// Never fails: storage errors are logged and treated as `Allowed` so that a
    /// broken store cannot keep the daemon down forever.
    pub fn should_attempt_launch(&self) -> LaunchDecision {
        let _guard = self.critical.lock().unwrap_or_else(|e| e.into_inner());

        let mut state = match self.store.load() {
            Ok(state) => state,
            Err(e) => {
                warn!("Could not read boot state, allowing launch: {e}");
                return LaunchDecision::Allowed;
            }
        };
        let now = self.clock.now();

        let decision = if state.manual_override {
            state.manual_override = false;
            info!("Manual override consumed, forcing launch");
            LaunchDecision::OverrideForced
        } else if state.launch_disabled {
            if !self.disabled_window_elapsed(&state, now) {
                warn!(
                    "Launch disabled after {} failed attempts; {}",
                    state.failure_count,
                    self.reenable_hint(&state)
                );
                return LaunchDecision::Blocked;
            }
            info!("Disabled window elapsed, re-enabling launch");
            state.launch_disabled = false;
            state.failure_count = 0;
            LaunchDecision::Allowed
        } else {
            return LaunchDecision::Allowed;
        };

        if let Err(e) = self.store.save(&state) {
            error!("Failed to persist launch decision {decision:?}: {e}");
        }
        decision
    }

    /// Count an attempt as failed until `record_success` says otherwise.
    pub fn record_attempt(&self) -> Result<u32> {
        let max_failures = self.config.max_failures;
        let count = self.update(|state, now| {
            state.failure_count = state.failure_count.saturating_add(1);
            state.last_attempt_time = Some(now);
            if state.failure_count >= max_failures {
                state.launch_disabled = true;
            }
            state.failure_count
        })?;

        if count >= max_failures {
            warn!("Attempt {count}/{max_failures} recorded, further automatic launches disabled");
        } else {
            info!("Attempt {count}/{max_failures} recorded");
        }
        Ok(count)
    }

    /// Close the circuit breaker after the daemon reported a full start.
    pub fn record_success(&self) -> Result<()> {
        self.update(|state, now| {
            state.failure_count = 0;
            state.launch_disabled = false;
            state.last_success_time = Some(now);
        })?;
        info!("Launch success recorded");
        Ok(())
    }

    /// Allow exactly one launch regardless of the failure history.
    pub fn enable_manual_override(&self) -> Result<()> {
        self.update(|state, _| state.manual_override = true)?;
        info!("Manual override enabled for the next boot");
        Ok(())
    }

    /// Drop all persisted history.
    pub fn reset(&self) -> Result<()> {
        let _guard = self.critical.lock().unwrap_or_else(|e| e.into_inner());
        self.store.clear()?;
        info!("Boot state reset");
        Ok(())
    }

    /// Current persisted state.
    pub fn state(&self) -> Result<BootLoopState> {
        let _guard = self.critical.lock().unwrap_or_else(|e| e.into_inner());
        self.store.load()
    }

    fn reenable_hint(&self, state: &BootLoopState) -> String {
        match state.last_attempt_time {
            Some(last) => format!("re-enables after {}", (last + self.config.disabled_timeout).to_rfc3339()),
            None => "re-enables on next check".to_string(),
        }
    }

    /// Human readable report of the persisted state.
    pub fn status_report(&self) -> Result<String> {
        let state = self.state()?;
        let format_time = |t: Option<DateTime<Utc>>| t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string());

        let launch = if state.launch_disabled {
            format!("DISABLED ({})", self.reenable_hint(&state))
        } else {
            "ENABLED".to_string()
        };
        let manual_override = if state.manual_override { "ENABLED" } else { "DISABLED" };

        let mut report = String::new();
        let _ = writeln!(report, "Failure count:   {}/{}", state.failure_count, self.config.max_failures);
        let _ = writeln!(report, "Launch:          {launch}");
        let _ = writeln!(report, "Manual override: {manual_override}");
        let _ = writeln!(report, "Last attempt:    {}", format_time(state.last_attempt_time));
        let _ = write!(report, "Last success:    {}", format_time(state.last_success_time));
        Ok(report)
    }
}
