//! Helper process launcher
//!
//! Runs the daemon's payload helper once, captures stdout verbatim, and keeps
//! its stderr drained by a background consumer so the helper never blocks on
//! a full pipe.

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{BootError, Result};

/// Default bound on reading the helper's stdout
pub const DEFAULT_HELPER_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a stopped helper gets to exit before it is killed
const STOP_GRACE: Duration = Duration::from_millis(500);

/// Opaque helper output. The content is never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Payload(String);

impl Payload {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload(<{} bytes>)", self.0.len())
    }
}

struct LogConsumer {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Spawns the payload helper and owns its log consumer between launches.
pub struct ProcessLauncher {
    timeout: Duration,
    consumer: Mutex<Option<LogConsumer>>,
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new(DEFAULT_HELPER_TIMEOUT)
    }
}

impl fmt::Debug for ProcessLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessLauncher")
            .field("timeout", &self.timeout)
            .field("consuming", &self.has_log_consumer())
            .finish()
    }
}

impl ProcessLauncher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            consumer: Mutex::new(None),
        }
    }

    /// Run `path args...` and return its stdout untouched.
    ///
    /// Spawn errors, empty output, non-UTF-8 output and a read that outlasts
    /// the timeout are all `LaunchFailure`.
    pub async fn launch(&self, path: impl AsRef<Path>, args: &[String]) -> Result<Payload> {
        let path = path.as_ref();
        self.stop_log_consumer().await;

        let mut child = Command::new(path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BootError::LaunchFailure(format!("failed to spawn {}: {e}", path.display())))?;
        info!("Spawned helper {} (pid {:?})", path.display(), child.id());

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.start_log_consumer(child, stderr);

        let Some(mut stdout) = stdout else {
            self.stop_log_consumer().await;
            return Err(BootError::LaunchFailure("helper stdout was not captured".to_string()));
        };

        let mut raw = Vec::new();
        let read = tokio::time::timeout(self.timeout, stdout.read_to_end(&mut raw)).await;
        let result = match read {
            Ok(Ok(_)) => decode_payload(raw),
            Ok(Err(e)) => Err(BootError::LaunchFailure(format!("reading helper output: {e}"))),
            Err(_) => Err(BootError::LaunchFailure(format!(
                "helper produced no complete output within {:?}",
                self.timeout
            ))),
        };

        match &result {
            Ok(payload) => debug!("Helper produced {} bytes", payload.len()),
            Err(_) => self.stop_log_consumer().await,
        }
        result
    }

    /// Whether a helper log consumer is still attached
    pub fn has_log_consumer(&self) -> bool {
        self.consumer.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Stop consuming the helper's log and reap it. A helper that outlives the
    /// grace period is killed. Safe to call when nothing is running.
    pub async fn stop_log_consumer(&self) {
        let consumer = self.consumer.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(consumer) = consumer else {
            return;
        };

        let _ = consumer.stop.send(());
        let mut task = consumer.task;
        match tokio::time::timeout(STOP_GRACE * 4, &mut task).await {
            Ok(Ok(())) => debug!("Helper log consumer stopped"),
            Ok(Err(e)) => warn!("Helper log consumer ended abnormally: {e}"),
            Err(_) => {
                warn!("Helper log consumer did not stop, aborting it");
                task.abort();
            }
        }
    }

    fn start_log_consumer(&self, child: Child, stderr: Option<ChildStderr>) {
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(consume_log(child, stderr, stopped));
        let previous = self
            .consumer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(LogConsumer { stop, task });
        if let Some(previous) = previous {
            previous.task.abort();
        }
    }
}

fn decode_payload(raw: Vec<u8>) -> Result<Payload> {
    if raw.is_empty() {
        return Err(BootError::LaunchFailure("helper produced no output".to_string()));
    }
    String::from_utf8(raw)
        .map(Payload)
        .map_err(|e| BootError::LaunchFailure(format!("helper output is not UTF-8: {e}")))
}

/// Log helper stderr line by line, then reap the helper. A stop request ends
/// the read early and kills the helper if it does not exit on its own.
async fn consume_log(mut child: Child, stderr: Option<ChildStderr>, mut stop: oneshot::Receiver<()>) {
    let mut stopped = false;

    if let Some(stderr) = stderr {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            tokio::select! {
                _ = &mut stop => {
                    stopped = true;
                    break;
                }
                read = reader.read_until(b'\n', &mut buf) => match read {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        debug!("[helper] {}", line.trim_end());
                    }
                    Err(e) => {
                        warn!("Helper log stream failed: {e}");
                        break;
                    }
                }
            }
        }
    }

    let status = if stopped {
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                debug!("Helper still running after stop, killing it");
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill helper: {e}");
                }
                child.wait().await
            }
        }
    } else {
        tokio::select! {
            status = child.wait() => status,
            _ = &mut stop => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill helper: {e}");
                }
                child.wait().await
            }
        }
    };

    match status {
        Ok(status) => debug!("Helper exited: {status}"),
        Err(e) => warn!("Failed to reap helper: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_launch_returns_stdout_untouched() {
        let launcher = ProcessLauncher::default();
        let payload = launcher.launch("sh", &sh("printf 'a,b\\n c\\n'")).await.unwrap();
        assert_eq!(payload.as_str(), "a,b\n c\n");
        launcher.stop_log_consumer().await;
    }

    #[tokio::test]
    async fn test_empty_output_is_launch_failure() {
        let launcher = ProcessLauncher::default();
        let err = launcher.launch("sh", &sh("true")).await.unwrap_err();
        assert!(matches!(err, BootError::LaunchFailure(_)));
        assert!(!launcher.has_log_consumer());
    }

    #[tokio::test]
    async fn test_missing_helper_is_launch_failure() {
        let launcher = ProcessLauncher::default();
        let err = launcher.launch("/nonexistent/helper", &[]).await.unwrap_err();
        assert!(matches!(err, BootError::LaunchFailure(_)));
    }

    #[tokio::test]
    async fn test_non_utf8_output_is_launch_failure() {
        let launcher = ProcessLauncher::default();
        let err = launcher.launch("sh", &sh("printf '\\377\\376'")).await.unwrap_err();
        assert!(err.to_string().contains("UTF-8"));
    }

    #[tokio::test]
    async fn test_hung_helper_times_out() {
        let launcher = ProcessLauncher::new(Duration::from_millis(100));
        let start = Instant::now();
        let err = launcher.launch("sh", &sh("sleep 5")).await.unwrap_err();
        assert!(matches!(err, BootError::LaunchFailure(_)));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_stderr_is_consumed_until_stopped() {
        let launcher = ProcessLauncher::default();
        let payload = launcher
            .launch("sh", &sh("printf payload; exec 1>&-; echo starting >&2; sleep 5"))
            .await
            .unwrap();
        assert_eq!(payload.as_str(), "payload");
        assert!(launcher.has_log_consumer());

        let start = Instant::now();
        launcher.stop_log_consumer().await;
        assert!(!launcher.has_log_consumer());
        assert!(start.elapsed() < Duration::from_secs(4));

        // Second stop is a no-op
        launcher.stop_log_consumer().await;
    }

    #[test]
    fn test_payload_debug_hides_content() {
        let payload = Payload("secret-args".to_string());
        let shown = format!("{payload:?}");
        assert!(!shown.contains("secret"));
        assert!(shown.contains("11 bytes"));
    }
}
