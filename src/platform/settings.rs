//! Global settings through the `settings` shell command.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::process::Command;
use tokio::sync::broadcast;

use super::SharedSetting;
use crate::error::{BootError, Result};

/// `settings <get|put|delete> <namespace> <key> [value]`
///
/// The command prefix is configurable (`["cmd", "settings"]` works too).
/// Change notifications are produced by polling, since the shell has no way
/// to register an observer.
#[derive(Debug, Clone)]
pub struct SettingsCommand {
    command: Vec<String>,
    namespace: String,
    timeout: Duration,
    poll_interval: Duration,
}

impl Default for SettingsCommand {
    fn default() -> Self {
        Self {
            command: vec!["settings".to_string()],
            namespace: "global".to_string(),
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl SettingsCommand {
    pub fn new(command: Vec<String>, namespace: impl Into<String>) -> Self {
        Self {
            command,
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or("settings")
    }

    async fn run(&self, args: &[&str]) -> std::io::Result<String> {
        let child = Command::new(self.program())
            .args(self.command.iter().skip(1))
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("{} timed out after {:?}", self.program(), self.timeout),
                ));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(std::io::Error::other(format!(
                "{} exited with {:?}: {}",
                self.program(),
                output.status.code(),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// The `settings` tool prints a literal `null` for absent keys.
fn parse_value(stdout: &str) -> Option<String> {
    let value = stdout.trim_end_matches(['\r', '\n']);
    if value.is_empty() || value == "null" {
        None
    } else {
        Some(value.to_string())
    }
}

#[async_trait]
impl SharedSetting for SettingsCommand {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let stdout = self.run(&["get", self.namespace.as_str(), key]).await?;
        Ok(parse_value(&stdout))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.run(&["put", self.namespace.as_str(), key, value])
            .await
            .map_err(|e| BootError::ConfigWriteFailure(format!("put {key}: {e}")))?;
        debug!("Wrote {} bytes to {}/{key}", value.len(), self.namespace);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.run(&["delete", self.namespace.as_str(), key])
            .await
            .map_err(|e| BootError::ConfigWriteFailure(format!("delete {key}: {e}")))?;
        debug!("Deleted {}/{key}", self.namespace);
        Ok(())
    }

    fn subscribe(&self, key: &str) -> broadcast::Receiver<String> {
        let (tx, rx) = broadcast::channel(16);
        let poller = self.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            let mut last: Option<Option<String>> = None;
            info!("Polling {}/{key} every {:?}", poller.namespace, poller.poll_interval);
            loop {
                if tx.receiver_count() == 0 {
                    debug!("No listeners left for {key}, stopping poll");
                    break;
                }
                match poller.get(&key).await {
                    Ok(value) => {
                        if last.as_ref() != Some(&value) {
                            last = Some(value);
                            let _ = tx.send(key.clone());
                        }
                    }
                    Err(e) => debug!("Polling {key} failed: {e}"),
                }
                tokio::time::sleep(poller.poll_interval).await;
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// A stand-in `settings` tool backed by one file per key, run through `sh`.
    fn fake_settings_tool(dir: &TempDir) -> Vec<String> {
        let script = dir.path().join("settings");
        let store = dir.path().join("store");
        fs::create_dir_all(&store).unwrap();
        fs::write(
            &script,
            format!(
                r#"#!/bin/sh
store="{}"
case "$1" in
  get) if [ -f "$store/$3" ]; then cat "$store/$3"; echo; else echo null; fi ;;
  put) printf '%s' "$4" > "$store/$3" ;;
  delete) rm -f "$store/$3" ;;
  *) echo "bad command" >&2; exit 2 ;;
esac
"#,
                store.display()
            ),
        )
        .unwrap();
        vec!["sh".to_string(), script.display().to_string()]
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("null\n"), None);
        assert_eq!(parse_value("\n"), None);
        assert_eq!(parse_value("abc\n"), Some("abc".to_string()));
        assert_eq!(parse_value(" spaced \n"), Some(" spaced ".to_string()));
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let settings = SettingsCommand::new(fake_settings_tool(&dir), "global");

        assert_eq!(settings.get("k").await.unwrap(), None);
        settings.put("k", "payload,with,commas").await.unwrap();
        assert_eq!(settings.get("k").await.unwrap(), Some("payload,with,commas".to_string()));
        settings.delete("k").await.unwrap();
        assert_eq!(settings.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_tool_is_config_write_failure() {
        let settings = SettingsCommand::new(vec!["/nonexistent/settings".to_string()], "global");
        let err = settings.put("k", "v").await.unwrap_err();
        assert!(matches!(err, BootError::ConfigWriteFailure(_)));
    }

    #[tokio::test]
    async fn test_subscribe_reports_changes() {
        let dir = TempDir::new().unwrap();
        let settings = SettingsCommand::new(fake_settings_tool(&dir), "global")
            .with_poll_interval(Duration::from_millis(20));

        let mut changes = settings.subscribe("status");
        // First poll establishes the baseline
        let first = tokio::time::timeout(Duration::from_secs(5), changes.recv()).await.unwrap();
        assert_eq!(first.unwrap(), "status");

        settings.put("status", "success").await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(5), changes.recv()).await.unwrap();
        assert_eq!(next.unwrap(), "status");
        assert_eq!(settings.get("status").await.unwrap(), Some("success".to_string()));
    }
}
