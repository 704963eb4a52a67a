//! In-memory state store.

use std::sync::Mutex;

use super::{BootLoopState, StateStore};
use crate::error::{BootError, Result};

/// Volatile store used by tests and dry runs.
///
/// `fail_io` makes every operation return a persistence failure, which lets
/// callers exercise the fail-open paths of the guard.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<BootLoopState>>,
    fail_io: bool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with an existing state
    pub fn with_state(state: BootLoopState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            fail_io: false,
        }
    }

    /// Store whose every operation fails
    pub fn failing() -> Self {
        Self {
            state: Mutex::new(None),
            fail_io: true,
        }
    }

    fn check(&self) -> Result<()> {
        if self.fail_io {
            return Err(BootError::PersistenceFailure("memory store configured to fail".to_string()));
        }
        Ok(())
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<BootLoopState> {
        self.check()?;
        let state = self
            .state
            .lock()
            .map_err(|e| BootError::PersistenceFailure(e.to_string()))?;
        Ok(state.clone().unwrap_or_default())
    }

    fn save(&self, new_state: &BootLoopState) -> Result<()> {
        self.check()?;
        let mut state = self
            .state
            .lock()
            .map_err(|e| BootError::PersistenceFailure(e.to_string()))?;
        *state = Some(new_state.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.check()?;
        let mut state = self
            .state
            .lock()
            .map_err(|e| BootError::PersistenceFailure(e.to_string()))?;
        *state = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStateStore::new();
        let state = BootLoopState {
            failure_count: 1,
            ..Default::default()
        };
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), state);

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), BootLoopState::default());
    }

    #[test]
    fn test_failing_store_errors() {
        let store = MemoryStateStore::failing();
        assert!(store.load().is_err());
        assert!(store.save(&BootLoopState::default()).is_err());
        assert!(store.clear().is_err());
    }
}
