use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::PathBuf;

mod cli;

use bootlaunch::config::Config;
use bootlaunch::orchestrator::{AttemptOutcome, BootOrchestrator, guard_from_config, probe_from_config};
use bootlaunch::signal::SignalOutcome;
use cli::Cli;
use cli::commands::Commands;

fn setup_logging(level: Option<log::LevelFilter>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bootlaunch")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("bootlaunch.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    let mut builder = env_logger::Builder::from_default_env();
    if let Some(level) = level {
        builder.filter_level(level);
    }
    builder.target(env_logger::Target::Pipe(target)).init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Running {:?}", cli.command);

    match &cli.command {
        Commands::Boot => handle_boot_command(config).await,
        Commands::Shutdown => handle_shutdown_command(config).await,
        Commands::Status { json } => handle_status_command(*json, config),
        Commands::Override => handle_override_command(config),
        Commands::Reset => handle_reset_command(config),
        Commands::Probe => handle_probe_command(config),
    }
}

async fn handle_boot_command(config: &Config) -> Result<()> {
    let orchestrator = BootOrchestrator::from_config(config);
    let report = orchestrator.on_boot_notification().await;

    let outcome = report.outcome.to_string();
    match &report.outcome {
        AttemptOutcome::Completed(SignalOutcome::Success) => println!("{} {}", "Launch:".green(), outcome),
        AttemptOutcome::AlreadyRunning => println!("{} {}", "Launch:".cyan(), outcome),
        AttemptOutcome::Blocked => {
            println!("{} {}", "Launch:".yellow(), outcome);
            println!("{}", orchestrator.guard().status_report()?);
        }
        _ => println!("{} {}", "Launch:".red(), outcome),
    }
    if let Some(len) = report.payload_len {
        println!("  Payload: {len} bytes");
    }
    if let Some(log_outcome) = report.log_outcome {
        println!("  Fork confirmation: {log_outcome}");
    }
    Ok(())
}

async fn handle_shutdown_command(config: &Config) -> Result<()> {
    BootOrchestrator::from_config(config).on_shutdown_notification().await;
    println!("{}", "Shared setting cleared".cyan());
    Ok(())
}

fn handle_status_command(json: bool, config: &Config) -> Result<()> {
    let guard = guard_from_config(config);
    if json {
        let state = guard.state().context("Failed to read boot state")?;
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        println!("{}", "Boot loop guard".bold());
        println!("{}", guard.status_report().context("Failed to read boot state")?);
    }
    Ok(())
}

fn handle_override_command(config: &Config) -> Result<()> {
    guard_from_config(config)
        .enable_manual_override()
        .context("Failed to enable manual override")?;
    println!("{}", "Manual override enabled for the next boot".green());
    Ok(())
}

fn handle_reset_command(config: &Config) -> Result<()> {
    guard_from_config(config).reset().context("Failed to reset boot state")?;
    println!("{}", "Boot state reset".green());
    Ok(())
}

fn handle_probe_command(config: &Config) -> Result<()> {
    let probe = probe_from_config(config);
    let running = probe
        .check_once()
        .with_context(|| format!("Failed to probe {}", probe.lock_path().display()))?;
    if running {
        println!("{} {}", "Daemon:".green(), "running");
    } else {
        println!("{} {}", "Daemon:".yellow(), "not running");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = cli.log_level(std::env::var_os("RUST_LOG").is_some());
    setup_logging(level).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    info!("Starting with config from: {:?}", cli.config);

    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
