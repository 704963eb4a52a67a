//! Construct the device-backed orchestrator from `Config`.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;

use super::{BootOrchestrator, OrchestratorConfig, WatcherFactories, WatcherFactory};
use crate::clock::SystemClock;
use crate::config::{CompletionSignal, Config};
use crate::error::Result;
use crate::guard::{BootLoopGuard, GuardConfig};
use crate::platform::{ActivityTrigger, SettingsCommand, SharedSetting};
use crate::probe::LivenessProbe;
use crate::signal::{LogStreamWatcher, MarkerWatcher, PropertyWatcher, SignalWatcher};
use crate::state::JsonStateStore;

/// Guard over the JSON state file named in `config`
pub fn guard_from_config(config: &Config) -> BootLoopGuard {
    BootLoopGuard::with_config(
        Arc::new(JsonStateStore::new(config.guard.state_file())),
        Arc::new(SystemClock),
        GuardConfig {
            max_failures: config.guard.max_failures,
            disabled_timeout: TimeDelta::seconds(config.guard.disabled_timeout_secs),
        },
    )
}

pub fn probe_from_config(config: &Config) -> LivenessProbe {
    LivenessProbe::new(&config.liveness.lock_file)
        .with_retry_delay(Duration::from_millis(config.liveness.retry_delay_ms))
}

pub fn settings_from_config(config: &Config) -> SettingsCommand {
    SettingsCommand::new(config.setting.command.clone(), config.setting.namespace.clone())
        .with_timeout(Duration::from_millis(config.setting.timeout_ms))
        .with_poll_interval(Duration::from_millis(config.setting.poll_interval_ms))
}

impl From<&Config> for OrchestratorConfig {
    fn from(config: &Config) -> Self {
        Self {
            shared_setting_key: config.setting.shared_key.clone(),
            helper_path: config.helper.path.clone(),
            helper_args: config.helper.args.clone(),
            helper_timeout: config.helper.timeout(),
            log_timeout: Duration::from_millis(config.log_stream.timeout_ms),
            completion_timeout: Duration::from_millis(config.timing.completion_timeout_ms),
            settle_delay: Duration::from_millis(config.timing.settle_delay_ms),
        }
    }
}

impl BootOrchestrator {
    /// Wire every capability to its command-backed device implementation.
    pub fn from_config(config: &Config) -> Self {
        let settings: Arc<dyn SharedSetting> = Arc::new(settings_from_config(config));
        let trigger = ActivityTrigger::new(config.trigger.package.clone(), config.trigger.activity.clone())
            .with_commands(
                config.trigger.package_manager.clone(),
                config.trigger.activity_manager.clone(),
            )
            .with_timeout(Duration::from_millis(config.trigger.timeout_ms));

        let log = config.log_stream.clone();
        let log_stream: WatcherFactory = Box::new(move || -> Result<Box<dyn SignalWatcher>> {
            let watcher: Box<dyn SignalWatcher> =
                Box::new(LogStreamWatcher::spawn(&log.command, &log.args, log.target.clone())?);
            Ok(watcher)
        });

        let completion: WatcherFactory = match config.completion {
            CompletionSignal::Marker => {
                let marker = config.marker.clone();
                Box::new(move || -> Result<Box<dyn SignalWatcher>> {
                    let watcher: Box<dyn SignalWatcher> =
                        Box::new(MarkerWatcher::new(&marker.status_dir, marker.name.clone()));
                    Ok(watcher)
                })
            }
            CompletionSignal::Property => {
                let settings = settings.clone();
                let key = config.setting.status_key.clone();
                Box::new(move || -> Result<Box<dyn SignalWatcher>> {
                    let watcher: Box<dyn SignalWatcher> = Box::new(PropertyWatcher::new(settings.clone(), key.clone()));
                    Ok(watcher)
                })
            }
        };

        Self::new(
            Arc::new(guard_from_config(config)),
            probe_from_config(config),
            settings,
            Arc::new(trigger),
            WatcherFactories { log_stream, completion },
            OrchestratorConfig::from(config),
        )
    }
}
