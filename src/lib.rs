//! bootlaunch - boot-time launcher for a privileged daemon
//!
//! On every boot notification the orchestrator decides (through a persisted
//! boot-loop guard) whether to try, checks the daemon is not already up,
//! produces a one-shot payload with the daemon's helper, hands it over through
//! a shared setting, fires a trigger app and waits for the daemon to report.

pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod launcher;
pub mod orchestrator;
pub mod platform;
pub mod probe;
pub mod signal;
pub mod state;

pub use error::{BootError, Result};
