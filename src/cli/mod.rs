//! CLI module for bootlaunch - command-line interface and subcommands.

pub mod commands;

pub use commands::Cli;
