use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::guard::{LAUNCH_DISABLED_TIMEOUT_S, MAX_FAILURES};

/// Base directory the daemon is installed under on the device
const DEVICE_BASE: &str = "/data/local/tmp/bootlaunch";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub helper: HelperConfig,
    pub setting: SettingConfig,
    pub trigger: TriggerConfig,
    pub marker: MarkerConfig,
    pub liveness: LivenessConfig,
    pub log_stream: LogStreamConfig,
    pub guard: GuardSection,
    pub timing: TimingConfig,
    pub completion: CompletionSignal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    pub path: PathBuf,
    pub args: Vec<String>,
    pub timeout_ms: u64,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEVICE_BASE).join("daemon"),
            args: vec!["build-payload".to_string()],
            timeout_ms: 10000,
        }
    }
}

impl HelperConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingConfig {
    pub command: Vec<String>,
    pub namespace: String,
    /// Setting the payload is written into
    pub shared_key: String,
    /// Setting the daemon reports its status through
    pub status_key: String,
    /// Per-invocation limit on the settings command
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for SettingConfig {
    fn default() -> Self {
        Self {
            command: vec!["settings".to_string()],
            namespace: "global".to_string(),
            shared_key: "hidden_api_blacklist_exemptions".to_string(),
            status_key: "bootlaunch_status".to_string(),
            timeout_ms: 5000,
            poll_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub package: String,
    pub activity: String,
    pub package_manager: Vec<String>,
    pub activity_manager: Vec<String>,
    pub timeout_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            package: "com.android.settings".to_string(),
            activity: "com.android.settings.Settings".to_string(),
            package_manager: vec!["pm".to_string()],
            activity_manager: vec!["am".to_string()],
            timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    pub status_dir: PathBuf,
    pub name: String,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            status_dir: PathBuf::from(DEVICE_BASE).join("status"),
            name: "daemon.started".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub lock_file: PathBuf,
    pub retry_delay_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            lock_file: PathBuf::from(DEVICE_BASE).join("daemon.lock"),
            retry_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogStreamConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Substring that marks the trigger app's process being forked
    pub target: String,
    pub timeout_ms: u64,
}

impl Default for LogStreamConfig {
    fn default() -> Self {
        Self {
            command: "logcat".to_string(),
            args: vec!["-v".to_string(), "brief".to_string(), "-T".to_string(), "1".to_string()],
            target: "Specializing controller".to_string(),
            timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardSection {
    /// Defaults to `<data_local_dir>/bootlaunch/boot_state.json`
    pub state_file: Option<PathBuf>,
    pub max_failures: u32,
    pub disabled_timeout_secs: i64,
}

impl Default for GuardSection {
    fn default() -> Self {
        Self {
            state_file: None,
            max_failures: MAX_FAILURES,
            disabled_timeout_secs: LAUNCH_DISABLED_TIMEOUT_S,
        }
    }
}

impl GuardSection {
    pub fn state_file(&self) -> PathBuf {
        self.state_file.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(env!("CARGO_PKG_NAME"))
                .join("boot_state.json")
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub completion_timeout_ms: u64,
    pub settle_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            completion_timeout_ms: 30000,
            settle_delay_ms: 0,
        }
    }
}

/// Which channel the daemon reports startup through
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionSignal {
    #[default]
    Marker,
    Property,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let project_name = env!("CARGO_PKG_NAME");

        // ~/.config/bootlaunch/bootlaunch.yml
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}
