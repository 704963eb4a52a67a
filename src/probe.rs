//! Daemon liveness probe
//!
//! The daemon holds an exclusive advisory lock on its lock file for as long as
//! it runs. Taking the shared form without waiting therefore tells us whether
//! anyone holds it exclusively.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use log::{debug, info, warn};

use crate::error::BootError;

/// Delay between attempts when the lock file cannot be opened
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Checks whether the privileged daemon is already running.
#[derive(Debug, Clone)]
pub struct LivenessProbe {
    lock_path: PathBuf,
    retry_delay: Duration,
}

impl LivenessProbe {
    pub fn new(lock_path: impl AsRef<Path>) -> Self {
        Self {
            lock_path: lock_path.as_ref().to_path_buf(),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Set the delay between attempts when the lock file cannot be opened
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    // Read access is enough for a shared lock. The file is only created when the
    // daemon has never run, so a missing file reads as "not running".
    fn open_lock_file(&self) -> std::io::Result<File> {
        match File::open(&self.lock_path) {
            Err(e) if e.kind() == ErrorKind::NotFound => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.lock_path),
            other => other,
        }
    }

    /// Single non-retrying check. Errors only when the lock file cannot be opened.
    pub fn check_once(&self) -> Result<bool, BootError> {
        let file = self.open_lock_file().map_err(|e| {
            BootError::ProbeFailure(format!("failed to open lock {}: {e}", self.lock_path.display()))
        })?;

        match FileExt::try_lock_shared(&file) {
            Ok(()) => {
                if let Err(e) = FileExt::unlock(&file) {
                    debug!("Failed to release probe lock on {}: {e}", self.lock_path.display());
                }
                Ok(false)
            }
            Err(e) => {
                if e.kind() != ErrorKind::WouldBlock {
                    debug!("Shared lock on {} refused: {e}", self.lock_path.display());
                }
                Ok(true)
            }
        }
    }

    /// Report whether the daemon holds its lock.
    ///
    /// An open failure (for example storage not mounted yet) is never turned into
    /// an answer; the probe sleeps and tries again until the file can be opened.
    pub async fn is_running(&self) -> bool {
        let mut attempts: u64 = 0;
        loop {
            match self.check_once() {
                Ok(running) => {
                    info!(
                        "Daemon lock {} is {}",
                        self.lock_path.display(),
                        if running { "held" } else { "free" }
                    );
                    return running;
                }
                Err(e) => {
                    attempts += 1;
                    warn!("{e}; retrying in {:?} (attempt {attempts})", self.retry_delay);
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_unlocked_file_reports_not_running() {
        let temp = TempDir::new().unwrap();
        let probe = LivenessProbe::new(temp.path().join("daemon.lock"));
        assert!(!probe.is_running().await);
    }

    #[tokio::test]
    async fn test_exclusive_holder_reports_running() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("daemon.lock");
        let holder = File::create(&path).unwrap();
        FileExt::try_lock_exclusive(&holder).unwrap();

        let probe = LivenessProbe::new(&path);
        assert!(probe.is_running().await);

        FileExt::unlock(&holder).unwrap();
        assert!(!probe.is_running().await);
    }

    #[tokio::test]
    async fn test_shared_holder_reports_not_running() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("daemon.lock");
        let reader = File::create(&path).unwrap();
        FileExt::try_lock_shared(&reader).unwrap();

        let probe = LivenessProbe::new(&path);
        assert!(!probe.is_running().await);
    }

    #[tokio::test]
    async fn test_open_error_keeps_retrying() {
        let temp = TempDir::new().unwrap();
        let probe = LivenessProbe::new(temp.path().join("not-mounted").join("daemon.lock"))
            .with_retry_delay(Duration::from_millis(10));

        let result = tokio::time::timeout(Duration::from_millis(100), probe.is_running()).await;
        assert!(result.is_err(), "probe must not resolve while the lock file is unreachable");
    }

    #[tokio::test]
    async fn test_resolves_once_storage_appears() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("late-mount");
        let probe = LivenessProbe::new(dir.join("daemon.lock")).with_retry_delay(Duration::from_millis(10));

        let mount = {
            let dir = dir.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                std::fs::create_dir_all(dir).unwrap();
            })
        };

        let running = tokio::time::timeout(Duration::from_secs(5), probe.is_running())
            .await
            .unwrap();
        assert!(!running);
        mount.await.unwrap();
    }

    #[test]
    fn test_check_once_reports_probe_failure() {
        let probe = LivenessProbe::new("/nonexistent-dir-for-probe/daemon.lock");
        assert!(matches!(probe.check_once(), Err(BootError::ProbeFailure(_))));
    }
}
