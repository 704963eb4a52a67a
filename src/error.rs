//! Error types for bootlaunch
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur during a boot attempt
#[derive(Debug, Error)]
pub enum BootError {
    /// Helper process failed to spawn or produced no output
    #[error("Launch failure: {0}")]
    LaunchFailure(String),

    /// Shared configuration value could not be written or cleared
    #[error("Config write failure: {0}")]
    ConfigWriteFailure(String),

    /// No completion signal arrived within the deadline
    #[error("Signal timeout: {0}")]
    SignalTimeout(String),

    /// The completion source reported an explicit failure
    #[error("Signal failure: {0}")]
    SignalFailure(String),

    /// Liveness check could not open the lock file
    #[error("Probe failure: {0}")]
    ProbeFailure(String),

    /// State store read/write error
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    /// Trigger app could not be resolved or started
    #[error("Trigger error: {0}")]
    Trigger(String),

    /// Filesystem watcher error
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for bootlaunch operations
pub type Result<T> = std::result::Result<T, BootError>;
