//! Boot sequence integration tests
//!
//! Drives `BootOrchestrator` end to end with a shell helper, in-memory
//! settings, a recording trigger standing in for the daemon, and real
//! marker, lock and state files in a temp directory.

use std::fs::{self, File};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bootlaunch::clock::ManualClock;
use bootlaunch::error::{BootError, Result};
use bootlaunch::guard::{BootLoopGuard, LaunchDecision};
use bootlaunch::orchestrator::{AttemptOutcome, BootOrchestrator, OrchestratorConfig, WatcherFactories, WatcherFactory};
use bootlaunch::platform::{LaunchTarget, MemorySetting, RecordingTrigger, SettingOp, SharedSetting};
use bootlaunch::probe::LivenessProbe;
use bootlaunch::signal::{LogStreamWatcher, MarkerWatcher, SignalOutcome, SignalWatcher};
use bootlaunch::state::JsonStateStore;
use chrono::Duration as ChronoDuration;
use fs2::FileExt;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const PAYLOAD_KEY: &str = "hidden_api_blacklist_exemptions";
const MARKER: &str = "daemon.started";
const FORK_LINE: &str = "I Zygote: Specializing controller for com.android.settings\n";

struct Harness {
    dir: TempDir,
    clock: Arc<ManualClock>,
    settings: Arc<MemorySetting>,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            clock: Arc::new(ManualClock::default()),
            settings: Arc::new(MemorySetting::new()),
        }
    }

    /// A guard over a state file shared by every guard built from this harness
    fn guard(&self) -> Arc<BootLoopGuard> {
        Arc::new(BootLoopGuard::new(
            Arc::new(JsonStateStore::new(self.dir.path().join("state/boot_state.json"))),
            self.clock.clone(),
        ))
    }

    fn status_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("status")
    }

    fn lock_path(&self) -> std::path::PathBuf {
        self.dir.path().join("daemon.lock")
    }

    fn config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            shared_setting_key: PAYLOAD_KEY.to_string(),
            helper_path: "sh".into(),
            helper_args: vec![
                "-c".to_string(),
                "printf 'com.android.settings,uid=2000'; echo 'helper ready' >&2".to_string(),
            ],
            helper_timeout: Duration::from_secs(5),
            log_timeout: Duration::from_millis(50),
            completion_timeout: Duration::from_millis(300),
            settle_delay: Duration::ZERO,
        }
    }

    fn watchers(&self) -> WatcherFactories {
        let status_dir = self.status_dir();
        WatcherFactories {
            log_stream: no_log_stream(),
            completion: Box::new(move || -> Result<Box<dyn SignalWatcher>> {
                Ok(Box::new(MarkerWatcher::new(&status_dir, MARKER)))
            }),
        }
    }

    /// Trigger that plays a daemon which starts and drops its marker
    fn starting_daemon(&self) -> Arc<RecordingTrigger> {
        let marker = self.status_dir().join(MARKER);
        Arc::new(
            RecordingTrigger::new(LaunchTarget::new("com.android.settings", "com.android.settings.Settings"))
                .on_fire(move |_| fs::write(&marker, b"").unwrap()),
        )
    }

    /// Trigger that plays a daemon which never comes up
    fn silent_daemon(&self) -> Arc<RecordingTrigger> {
        Arc::new(RecordingTrigger::new(LaunchTarget::new(
            "com.android.settings",
            "com.android.settings.Settings",
        )))
    }

    fn orchestrator(&self, trigger: Arc<RecordingTrigger>, watchers: WatcherFactories) -> BootOrchestrator {
        BootOrchestrator::new(
            self.guard(),
            LivenessProbe::new(self.lock_path()),
            self.settings.clone(),
            trigger,
            watchers,
            self.config(),
        )
    }

    fn payload_writes(&self) -> usize {
        self.settings
            .history()
            .iter()
            .filter(|op| matches!(op, SettingOp::Put(key, _) if key == PAYLOAD_KEY))
            .count()
    }
}

fn no_log_stream() -> WatcherFactory {
    Box::new(|| -> Result<Box<dyn SignalWatcher>> {
        Err(BootError::SignalFailure("log stream disabled".to_string()))
    })
}

/// Log stream replaying `backlog`, then whatever is written to the returned pipe.
fn piped_log_stream(backlog: &'static str) -> (WatcherFactory, Arc<tokio::sync::Mutex<DuplexStream>>) {
    let (writer, reader) = tokio::io::duplex(4096);
    let reader = Mutex::new(Some(reader));

    let factory: WatcherFactory = Box::new(move || -> Result<Box<dyn SignalWatcher>> {
        let live = reader
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| BootError::SignalFailure("log stream already used".to_string()))?;
        let stream = backlog.as_bytes().chain(live);
        Ok(Box::new(LogStreamWatcher::from_reader("logcat", stream, "Specializing controller")))
    });
    (factory, Arc::new(tokio::sync::Mutex::new(writer)))
}

#[tokio::test]
async fn test_successful_boot_sequence() {
    let harness = Harness::new();
    let trigger = harness.starting_daemon();
    let orchestrator = harness.orchestrator(trigger.clone(), harness.watchers());

    let report = orchestrator.on_boot_notification().await;

    assert!(report.succeeded(), "{report:?}");
    assert_eq!(report.decision, LaunchDecision::Allowed);
    assert_eq!(report.payload_len, Some("com.android.settings,uid=2000".len()));
    assert_eq!(trigger.fired().len(), 1);

    let state = orchestrator.guard().state().unwrap();
    assert_eq!(state.failure_count, 0);
    assert!(state.last_success_time.is_some());

    // Payload written exactly once, and cleared afterwards
    assert_eq!(harness.payload_writes(), 1);
    assert_eq!(harness.settings.value(PAYLOAD_KEY), None);
    assert_eq!(
        harness.settings.history().last(),
        Some(&SettingOp::Delete(PAYLOAD_KEY.to_string()))
    );

    // The marker was consumed
    assert!(!harness.status_dir().join(MARKER).exists());
}

#[tokio::test]
async fn test_stale_marker_is_discarded_before_launch() {
    let harness = Harness::new();
    fs::create_dir_all(harness.status_dir()).unwrap();
    fs::write(harness.status_dir().join(MARKER), b"").unwrap();

    let orchestrator = harness.orchestrator(harness.silent_daemon(), harness.watchers());
    let report = orchestrator.on_boot_notification().await;

    assert_eq!(report.outcome, AttemptOutcome::Completed(SignalOutcome::Timeout));
    assert_eq!(orchestrator.guard().state().unwrap().failure_count, 1);
}

#[tokio::test]
async fn test_timeout_leaves_failure_recorded() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(harness.silent_daemon(), harness.watchers());

    let report = orchestrator.on_boot_notification().await;

    assert_eq!(report.outcome, AttemptOutcome::Completed(SignalOutcome::Timeout));
    let state = orchestrator.guard().state().unwrap();
    assert_eq!(state.failure_count, 1);
    assert!(state.last_attempt_time.is_some());
    assert!(state.last_success_time.is_none());
    assert_eq!(harness.settings.value(PAYLOAD_KEY), None);
}

#[tokio::test]
async fn test_repeated_failures_block_until_override() {
    let harness = Harness::new();
    let trigger = harness.silent_daemon();
    let orchestrator = harness.orchestrator(trigger.clone(), harness.watchers());

    for attempt in 1..=5 {
        let report = orchestrator.on_boot_notification().await;
        assert_eq!(report.decision, LaunchDecision::Allowed, "attempt {attempt}");
        assert_eq!(orchestrator.guard().state().unwrap().failure_count, attempt);
    }
    assert!(orchestrator.guard().state().unwrap().launch_disabled);

    let report = orchestrator.on_boot_notification().await;
    assert_eq!(report.outcome, AttemptOutcome::Blocked);
    assert_eq!(trigger.fired().len(), 5);

    // An administrator forces exactly one more attempt
    harness.guard().enable_manual_override().unwrap();
    let report = orchestrator.on_boot_notification().await;
    assert_eq!(report.decision, LaunchDecision::OverrideForced);
    assert_eq!(trigger.fired().len(), 6);

    let report = orchestrator.on_boot_notification().await;
    assert_eq!(report.outcome, AttemptOutcome::Blocked);
}

#[tokio::test]
async fn test_disabled_launch_recovers_after_timeout() {
    let harness = Harness::new();
    let guard = harness.guard();
    for _ in 0..5 {
        guard.record_attempt().unwrap();
    }

    let orchestrator = harness.orchestrator(harness.starting_daemon(), harness.watchers());
    assert_eq!(orchestrator.on_boot_notification().await.outcome, AttemptOutcome::Blocked);

    harness.clock.advance(ChronoDuration::seconds(3601));
    let report = orchestrator.on_boot_notification().await;
    assert_eq!(report.decision, LaunchDecision::Allowed);
    assert!(report.succeeded(), "{report:?}");

    let state = guard.state().unwrap();
    assert_eq!(state.failure_count, 0);
    assert!(!state.launch_disabled);
}

#[tokio::test]
async fn test_running_daemon_is_not_launched_twice() {
    let harness = Harness::new();
    let lock = File::create(harness.lock_path()).unwrap();
    FileExt::lock_exclusive(&lock).unwrap();

    let trigger = harness.starting_daemon();
    let orchestrator = harness.orchestrator(trigger.clone(), harness.watchers());
    let report = orchestrator.on_boot_notification().await;

    assert_eq!(report.outcome, AttemptOutcome::AlreadyRunning);
    assert!(trigger.fired().is_empty());
    assert_eq!(harness.payload_writes(), 0);

    FileExt::unlock(&lock).unwrap();
}

#[tokio::test]
async fn test_helper_failure_cleans_up() {
    let harness = Harness::new();
    let trigger = harness.starting_daemon();
    let mut config = harness.config();
    config.helper_args = vec!["-c".to_string(), "echo 'no payload today' >&2; exit 3".to_string()];

    let orchestrator = BootOrchestrator::new(
        harness.guard(),
        LivenessProbe::new(harness.lock_path()),
        harness.settings.clone(),
        trigger.clone(),
        harness.watchers(),
        config,
    );
    let report = orchestrator.on_boot_notification().await;

    assert!(matches!(report.outcome, AttemptOutcome::Aborted(_)), "{report:?}");
    assert_eq!(report.payload_len, None);
    assert!(trigger.fired().is_empty());
    assert_eq!(harness.payload_writes(), 0);
    assert_eq!(orchestrator.guard().state().unwrap().failure_count, 1);
}

#[tokio::test]
async fn test_payload_write_failure_aborts_before_trigger() {
    let harness = Harness::new();
    let trigger = harness.starting_daemon();
    let orchestrator = harness.orchestrator(trigger.clone(), harness.watchers());
    harness.settings.set_fail_writes(true);

    let report = orchestrator.on_boot_notification().await;

    assert!(
        matches!(report.outcome, AttemptOutcome::Aborted(ref reason) if reason.contains("Config write failure")),
        "{report:?}"
    );
    assert!(trigger.fired().is_empty());
}

#[tokio::test]
async fn test_state_survives_new_orchestrator() {
    let harness = Harness::new();
    {
        let orchestrator = harness.orchestrator(harness.silent_daemon(), harness.watchers());
        orchestrator.on_boot_notification().await;
        orchestrator.on_boot_notification().await;
    }

    // A later boot builds everything from scratch over the same state file
    let orchestrator = harness.orchestrator(harness.starting_daemon(), harness.watchers());
    assert_eq!(orchestrator.guard().state().unwrap().failure_count, 2);
    assert!(orchestrator.on_boot_notification().await.succeeded());
    assert_eq!(orchestrator.guard().state().unwrap().failure_count, 0);
}

#[tokio::test]
async fn test_log_stream_confirms_fork_after_trigger() {
    let harness = Harness::new();
    let (log_stream, writer) = piped_log_stream("I Zygote: Specializing controller for an earlier boot\n");
    let status_dir = harness.status_dir();
    let watchers = WatcherFactories {
        log_stream,
        completion: Box::new(move || -> Result<Box<dyn SignalWatcher>> {
            Ok(Box::new(MarkerWatcher::new(&status_dir, MARKER)))
        }),
    };

    let marker = harness.status_dir().join(MARKER);
    let trigger = Arc::new(
        RecordingTrigger::new(LaunchTarget::new("com.android.settings", "com.android.settings.Settings")).on_fire(
            move |_| {
                let writer = writer.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    writer.lock().await.write_all(FORK_LINE.as_bytes()).await.unwrap();
                });
                fs::write(&marker, b"").unwrap();
            },
        ),
    );

    let mut config = harness.config();
    config.log_timeout = Duration::from_secs(2);
    let orchestrator = BootOrchestrator::new(
        harness.guard(),
        LivenessProbe::new(harness.lock_path()),
        harness.settings.clone(),
        trigger,
        watchers,
        config,
    );

    let report = orchestrator.on_boot_notification().await;
    assert_eq!(report.log_outcome, Some(SignalOutcome::Success));
    assert!(report.succeeded(), "{report:?}");
}

#[tokio::test]
async fn test_log_stream_backlog_does_not_confirm() {
    let harness = Harness::new();
    let (log_stream, _writer) = piped_log_stream("I Zygote: Specializing controller for an earlier boot\n");
    let status_dir = harness.status_dir();
    let watchers = WatcherFactories {
        log_stream,
        completion: Box::new(move || -> Result<Box<dyn SignalWatcher>> {
            Ok(Box::new(MarkerWatcher::new(&status_dir, MARKER)))
        }),
    };

    let orchestrator = harness.orchestrator(harness.starting_daemon(), watchers);
    let report = orchestrator.on_boot_notification().await;

    // Advisory only: no confirmation, but the daemon still started
    assert_eq!(report.log_outcome, Some(SignalOutcome::Timeout));
    assert!(report.succeeded(), "{report:?}");
}

#[tokio::test]
async fn test_shutdown_clears_leftover_payload() {
    let harness = Harness::new();
    harness.settings.put(PAYLOAD_KEY, "leftover").await.unwrap();
    let orchestrator = harness.orchestrator(harness.silent_daemon(), harness.watchers());

    orchestrator.on_shutdown_notification().await;
    assert_eq!(harness.settings.value(PAYLOAD_KEY), None);
}
