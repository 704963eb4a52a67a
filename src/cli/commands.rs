//! CLI command definitions using clap.
//!
//! - boot / shutdown: the host notifications
//! - status / override / reset: boot-loop guard administration
//! - probe: daemon liveness check

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// bootlaunch - boot-time launcher for a privileged daemon
#[derive(Parser, Debug)]
#[command(name = "bootlaunch")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Level to force on the logger, given whether RUST_LOG is set
    pub fn log_level(&self, rust_log_set: bool) -> Option<log::LevelFilter> {
        (self.is_verbose() && !rust_log_set).then_some(log::LevelFilter::Debug)
    }
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run one launch attempt, as on a boot-completed notification
    Boot,

    /// Clear the shared setting, as on a shutdown notification
    Shutdown,

    /// Show the boot-loop guard state
    Status {
        /// Print the raw persisted state as JSON
        #[arg(long)]
        json: bool,
    },

    /// Allow the next launch regardless of failure history
    Override,

    /// Clear all boot-loop guard state
    Reset,

    /// Report whether the daemon holds its liveness lock
    Probe,
}
