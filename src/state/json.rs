//! JSON file backed state store.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use super::{BootLoopState, StateStore};
use crate::error::{BootError, Result};

/// Stores `BootLoopState` as a single JSON document.
///
/// Writes go to a sibling temp file which is then renamed over the target, so a
/// crash mid-write leaves either the old or the new state on disk.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    /// Create a store at the given file path.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling(".tmp")
    }

    /// Where an unreadable state document is moved aside to
    pub fn corrupt_path(&self) -> PathBuf {
        self.sibling(".corrupt")
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(suffix);
        self.path.with_file_name(name)
    }

    /// Move an unparseable document aside so the next save starts clean.
    fn discard_corrupt(&self, err: &serde_json::Error) -> BootLoopState {
        let backup = self.corrupt_path();
        warn!(
            "Boot state {} is corrupt ({err}), starting from defaults",
            self.path.display()
        );
        match fs::rename(&self.path, &backup) {
            Ok(()) => info!("Moved corrupt boot state to {}", backup.display()),
            Err(e) => warn!("Failed to move corrupt boot state aside: {e}"),
        }
        BootLoopState::default()
    }
}

fn persistence(context: &str, path: &Path, err: impl std::fmt::Display) -> BootError {
    BootError::PersistenceFailure(format!("{context} {}: {err}", path.display()))
}

impl StateStore for JsonStateStore {
    fn load(&self) -> Result<BootLoopState> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BootLoopState::default()),
            Ok(content) => match serde_json::from_str(&content) {
                Ok(state) => Ok(state),
                Err(e) => Ok(self.discard_corrupt(&e)),
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("State file {} not found, using defaults", self.path.display());
                Ok(BootLoopState::default())
            }
            Err(e) => Err(persistence("Failed to read", &self.path, e)),
        }
    }

    fn save(&self, state: &BootLoopState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| persistence("Failed to create", parent, e))?;
        }

        let content = serde_json::to_string_pretty(state)?;
        let temp = self.temp_path();
        fs::write(&temp, content).map_err(|e| persistence("Failed to write", &temp, e))?;
        fs::rename(&temp, &self.path).map_err(|e| persistence("Failed to replace", &self.path, e))?;

        debug!("Wrote boot state to {}", self.path.display());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Removed boot state {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(persistence("Failed to remove", &self.path, e)),
        }
    }
}
