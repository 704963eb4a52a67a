//! Trigger app via the package and activity managers.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::process::Command;

use super::{AppTrigger, LaunchTarget};
use crate::error::{BootError, Result};

/// Resolves the trigger package with `pm path` and starts it with `am start -n`.
#[derive(Debug, Clone)]
pub struct ActivityTrigger {
    package: String,
    activity: String,
    package_manager: Vec<String>,
    activity_manager: Vec<String>,
    timeout: Duration,
}

impl ActivityTrigger {
    pub fn new(package: impl Into<String>, activity: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            activity: activity.into(),
            package_manager: vec!["pm".to_string()],
            activity_manager: vec!["am".to_string()],
            timeout: Duration::from_secs(5),
        }
    }

    /// Override the `pm` and `am` command prefixes.
    pub fn with_commands(mut self, package_manager: Vec<String>, activity_manager: Vec<String>) -> Self {
        self.package_manager = package_manager;
        self.activity_manager = activity_manager;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, command: &[String], args: &[&str]) -> Result<String> {
        let program = command
            .first()
            .ok_or_else(|| BootError::Trigger("empty command".to_string()))?;

        let child = Command::new(program)
            .args(&command[1..])
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BootError::Trigger(format!("failed to spawn {program}: {e}")))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(BootError::Trigger(format!("{program} failed: {e}"))),
            Err(_) => return Err(BootError::Trigger(format!("{program} timed out after {:?}", self.timeout))),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(BootError::Trigger(format!(
                "{program} exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(stdout)
    }
}

/// `pm path` prints one `package:<apk>` line per split; the first is the base.
fn parse_package_path(package: &str, stdout: &str) -> Result<String> {
    stdout
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("package:"))
        .filter(|path| !path.is_empty())
        .map(str::to_string)
        .ok_or_else(|| BootError::Trigger(format!("Could not find package {package}")))
}

#[async_trait]
impl AppTrigger for ActivityTrigger {
    async fn resolve(&self) -> Result<LaunchTarget> {
        let stdout = self.run(&self.package_manager, &["path", self.package.as_str()]).await?;
        let code_path = parse_package_path(&self.package, &stdout)?;
        debug!("Resolved {} at {code_path}", self.package);

        Ok(LaunchTarget {
            package: self.package.clone(),
            activity: self.activity.clone(),
            code_path: Some(code_path),
        })
    }

    async fn fire(&self, target: &LaunchTarget) -> Result<()> {
        let component = target.component();
        let stdout = self.run(&self.activity_manager, &["start", "-n", component.as_str()]).await?;

        // am reports resolution problems on stdout with a zero exit status
        if let Some(line) = stdout.lines().find(|line| line.starts_with("Error")) {
            return Err(BootError::Trigger(format!("am start {component}: {}", line.trim())));
        }

        info!("Started {component}");
        Ok(())
    }
}
