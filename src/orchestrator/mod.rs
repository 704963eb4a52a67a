//! Boot sequence orchestration
//!
//! `BootOrchestrator` composes the guard, liveness probe, helper launcher,
//! shared setting, trigger and signal watchers into one launch attempt per
//! boot notification. Every step failure is logged and the attempt moves on
//! to cleanup; nothing escapes to the caller.

mod armed;
mod wiring;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::guard::{BootLoopGuard, LaunchDecision};
use crate::launcher::{DEFAULT_HELPER_TIMEOUT, ProcessLauncher};
use crate::platform::{AppTrigger, SharedSetting};
use crate::probe::LivenessProbe;
use crate::signal::{SignalOutcome, SignalWatcher};

use armed::ArmedSetting;
pub use wiring::{guard_from_config, probe_from_config, settings_from_config};

/// Builds a fresh watcher for each attempt
pub type WatcherFactory = Box<dyn Fn() -> Result<Box<dyn SignalWatcher>> + Send + Sync>;

/// Watcher constructors used by each attempt
pub struct WatcherFactories {
    /// Advisory watcher confirming the trigger app was forked
    pub log_stream: WatcherFactory,
    /// Authoritative watcher for the daemon's startup report
    pub completion: WatcherFactory,
}

impl fmt::Debug for WatcherFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatcherFactories").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub shared_setting_key: String,
    pub helper_path: PathBuf,
    pub helper_args: Vec<String>,
    pub helper_timeout: Duration,
    pub log_timeout: Duration,
    pub completion_timeout: Duration,
    pub settle_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            shared_setting_key: "hidden_api_blacklist_exemptions".to_string(),
            helper_path: PathBuf::from("/data/local/tmp/bootlaunch/daemon"),
            helper_args: vec!["build-payload".to_string()],
            helper_timeout: DEFAULT_HELPER_TIMEOUT,
            log_timeout: Duration::from_secs(1),
            completion_timeout: Duration::from_secs(30),
            settle_delay: Duration::ZERO,
        }
    }
}

/// How an attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The guard refused the attempt
    Blocked,
    /// The daemon already holds its liveness lock
    AlreadyRunning,
    /// The completion watcher resolved
    Completed(SignalOutcome),
    /// A step failed before the completion wait
    Aborted(String),
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Blocked => write!(f, "blocked"),
            AttemptOutcome::AlreadyRunning => write!(f, "already running"),
            AttemptOutcome::Completed(outcome) => write!(f, "completed ({outcome})"),
            AttemptOutcome::Aborted(reason) => write!(f, "aborted: {reason}"),
        }
    }
}

/// Summary of one boot notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub decision: LaunchDecision,
    pub outcome: AttemptOutcome,
    /// Size of the helper payload, if one was produced
    pub payload_len: Option<usize>,
    /// Advisory result of the log-stream confirmation
    pub log_outcome: Option<SignalOutcome>,
}

impl AttemptReport {
    fn new(decision: LaunchDecision) -> Self {
        Self {
            decision,
            outcome: AttemptOutcome::Blocked,
            payload_len: None,
            log_outcome: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == AttemptOutcome::Completed(SignalOutcome::Success)
    }
}

pub struct BootOrchestrator {
    guard: Arc<BootLoopGuard>,
    probe: LivenessProbe,
    settings: Arc<dyn SharedSetting>,
    trigger: Arc<dyn AppTrigger>,
    watchers: WatcherFactories,
    launcher: ProcessLauncher,
    config: OrchestratorConfig,
    in_flight: Mutex<()>,
}

impl fmt::Debug for BootOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootOrchestrator")
            .field("probe", &self.probe)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BootOrchestrator {
    pub fn new(
        guard: Arc<BootLoopGuard>,
        probe: LivenessProbe,
        settings: Arc<dyn SharedSetting>,
        trigger: Arc<dyn AppTrigger>,
        watchers: WatcherFactories,
        config: OrchestratorConfig,
    ) -> Self {
        let launcher = ProcessLauncher::new(config.helper_timeout);
        Self {
            guard,
            probe,
            settings,
            trigger,
            watchers,
            launcher,
            config,
            in_flight: Mutex::new(()),
        }
    }

    pub fn guard(&self) -> &Arc<BootLoopGuard> {
        &self.guard
    }

    /// Run one launch attempt in response to the host's boot notification.
    ///
    /// Concurrent notifications are serialised. The returned report is
    /// informational; all failures have already been logged.
    pub async fn on_boot_notification(&self) -> AttemptReport {
        let _in_flight = self.in_flight.lock().await;
        info!("Boot notification received");

        let mut armed = ArmedSetting::new(self.settings.clone(), &self.config.shared_setting_key);
        armed.clear("before attempt").await;

        let decision = self.guard.should_attempt_launch();
        let mut report = AttemptReport::new(decision);
        if !decision.is_allowed() {
            match self.guard.status_report() {
                Ok(status) => warn!("Launch blocked by boot loop guard\n{status}"),
                Err(e) => warn!("Launch blocked by boot loop guard (status unavailable: {e})"),
            }
            return report;
        }
        if decision == LaunchDecision::OverrideForced {
            info!("Manual override consumed, forcing launch");
        }

        if let Err(e) = self.guard.record_attempt() {
            error!("Failed to record launch attempt: {e}");
        }

        if self.probe.is_running().await {
            info!("Daemon already running, skipping launch");
            report.outcome = AttemptOutcome::AlreadyRunning;
            return report;
        }

        let mut log_watcher = match (self.watchers.log_stream)() {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Log stream unavailable, continuing without it: {e}");
                None
            }
        };
        let mut completion = None;

        let result = self
            .attempt(&mut armed, &mut log_watcher, &mut completion, &mut report)
            .await;
        report.outcome = match result {
            Ok(outcome) => AttemptOutcome::Completed(outcome),
            Err(e) => {
                error!("Launch attempt failed: {e}");
                AttemptOutcome::Aborted(e.to_string())
            }
        };

        // Cleanup runs on every path past the guard
        if armed.is_armed() {
            armed.clear("cleanup").await;
        }
        if let Some(watcher) = log_watcher.as_mut() {
            watcher.cancel();
        }
        if let Some(watcher) = completion.as_mut() {
            watcher.cancel();
        }

        match &report.outcome {
            AttemptOutcome::Completed(SignalOutcome::Success) => match self.guard.record_success() {
                Ok(()) => info!("Daemon started"),
                Err(e) => error!("Daemon started but recording success failed: {e}"),
            },
            AttemptOutcome::Completed(outcome) => {
                if let Err(e) = outcome.into_result("completion") {
                    warn!("Daemon did not report startup: {e}");
                }
            }
            _ => {}
        }

        if !self.config.settle_delay.is_zero() {
            debug!("Settling for {:?}", self.config.settle_delay);
            tokio::time::sleep(self.config.settle_delay).await;
        }
        self.launcher.stop_log_consumer().await;

        info!("Launch attempt {}", report.outcome);
        report
    }

    /// Steps from arming the completion watcher to its result. Errors abort
    /// the attempt; the caller cleans up.
    async fn attempt(
        &self,
        armed: &mut ArmedSetting,
        log_watcher: &mut Option<Box<dyn SignalWatcher>>,
        completion: &mut Option<Box<dyn SignalWatcher>>,
        report: &mut AttemptReport,
    ) -> Result<SignalOutcome> {
        let watcher = completion.insert((self.watchers.completion)()?);
        watcher.reset().await?;
        watcher.arm().await?;
        debug!("Armed {} watcher", watcher.name());

        let payload = self
            .launcher
            .launch(&self.config.helper_path, &self.config.helper_args)
            .await?;
        report.payload_len = Some(payload.len());

        let target = self.trigger.resolve().await?;
        debug!("Trigger resolved to {}", target.component());

        armed.write(payload.as_str()).await?;
        drop(payload);

        let fired = self.trigger.fire(&target).await;

        if fired.is_ok() {
            if let Some(log) = log_watcher.as_mut() {
                let outcome = log.wait(self.config.log_timeout).await;
                match outcome {
                    SignalOutcome::Success => info!("Trigger process fork observed"),
                    other => debug!("No fork confirmation from log stream ({other})"),
                }
                report.log_outcome = Some(outcome);
            }
        }

        armed.clear("after trigger").await;
        fired?;

        let outcome = watcher.wait(self.config.completion_timeout).await;
        info!("Completion watcher {} reported {outcome}", watcher.name());
        Ok(outcome)
    }

    /// Clear any armed payload on shutdown and stop the helper's log consumer.
    /// Best effort; the clear before each attempt is what guarantees a clean slate.
    pub async fn on_shutdown_notification(&self) {
        info!("Shutdown notification received");
        if let Err(e) = self.settings.delete(&self.config.shared_setting_key).await {
            warn!("Failed to clear {} on shutdown: {e}", self.config.shared_setting_key);
        }
        self.launcher.stop_log_consumer().await;
    }
}
