//! `opensync` - UPS power sequencer and flight-log relay
//!
//! Exits with status 255 after releasing the heartbeat when
//! `daemon.enable_shutdown` is set; the service unit powers the host off
//! on that code.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use opensync::cli::{Cli, Command, ConfigCommand, LedgerCommand, SendCommand};
use opensync::daemon::{self, Daemon, Disposition};
use opensync::status::StatusReport;
use opensync::{init_logging, Config, Storage};

#[cfg(target_os = "linux")]
use opensync_linux as platform;

#[cfg(not(target_os = "linux"))]
mod platform {
    pub fn platform_name() -> &'static str {
        "unsupported"
    }

    pub fn init() -> Result<(), Box<dyn std::error::Error>> {
        Err("sysfs GPIO is only available on Linux".into())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    init_logging(cli.verbosity());

    if let Command::Config(ConfigCommand::Validate { file }) = &cli.command {
        return handle_validate(file.clone().or_else(|| cli.config.clone()));
    }

    let config = Config::load_from(cli.config.clone()).context("failed to load configuration")?;

    match cli.command {
        Command::Run(cmd) => handle_run(config, cmd.simulate).await,
        Command::Setup(cmd) => {
            handle_setup(&config, cmd.simulate)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Probe(cmd) => {
            handle_probe(&config, cmd.simulate, cmd.json).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Status(cmd) => {
            handle_status(&config, cmd.json)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Send(cmd) => handle_send(&config, &cmd).await,
        Command::Ledger(cmd) => {
            handle_ledger(&config, &cmd)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Config(cmd) => {
            handle_config(&config, &cmd)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn handle_run(config: Config, simulate: bool) -> anyhow::Result<ExitCode> {
    tracing::info!(platform = platform::platform_name(), simulate, "starting opensync");
    let disposition = Daemon::new(config, simulate)?.run().await?;
    if let Disposition::Released { report, power_off } = &disposition {
        tracing::info!(
            outcome = %report.outcome,
            elapsed_ms = report.elapsed_ms,
            power_off,
            "heartbeat released"
        );
    }
    Ok(ExitCode::from(disposition.exit_code()))
}

fn handle_setup(config: &Config, simulate: bool) -> anyhow::Result<()> {
    if !simulate && config.gpio.backend == opensync::config::GpioBackend::Sysfs {
        platform::init().map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    daemon::setup(config, simulate).context("failed to configure UPS lines")?;
    println!(
        "UPS lines configured (power-fault {}, ups-online {}, host-alive {})",
        config.gpio.power_fault_pin, config.gpio.ups_online_pin, config.gpio.heartbeat_pin
    );
    Ok(())
}

async fn handle_probe(config: &Config, simulate: bool, json: bool) -> anyhow::Result<()> {
    let report = daemon::probe(config, simulate)
        .await
        .context("failed to probe UPS lines")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Backend:       {}", report.backend);
        println!("Power fault:   {}", report.power_fault);
        println!("UPS online:    {}", report.ups_online);
        println!("Power status:  {}", report.status);
        match report.ups {
            Some(probe) => println!(
                "UPS battery:   {:?} ({})",
                probe,
                if probe.battery_present() {
                    "present"
                } else {
                    "not detected"
                }
            ),
            None => println!("UPS battery:   not probed"),
        }
    }
    Ok(())
}

fn handle_status(config: &Config, json: bool) -> anyhow::Result<()> {
    let path = config.status_path();
    let report = StatusReport::read(&path)
        .with_context(|| format!("no status at {} (is opensync running?)", path.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("opensync status");
        println!("---------------");
        println!("Platform:      {}", platform::platform_name());
        println!("PID:           {}", report.pid);
        println!("Backend:       {}", report.backend);
        println!("Updated:       {}", report.updated_at.to_rfc3339());
        println!("{}", report.summary());
    }
    Ok(())
}

async fn handle_send(config: &Config, cmd: &SendCommand) -> anyhow::Result<ExitCode> {
    let mut pipeline = daemon::open_pipeline(config)
        .context("failed to open sync pipeline")?
        .with_force(config.sync.force || cmd.force);
    let summary = pipeline.send_paths(&cmd.paths).await?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for name in &summary.sent {
            println!("sent     {name}");
        }
        for name in &summary.skipped {
            println!("skipped  {name} (already sent, use --force to resend)");
        }
        for name in &summary.failed {
            println!("failed   {name}");
        }
        println!(
            "{} sent, {} skipped, {} failed",
            summary.sent.len(),
            summary.skipped.len(),
            summary.failed.len()
        );
    }

    if summary.failed.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn handle_ledger(config: &Config, cmd: &LedgerCommand) -> anyhow::Result<()> {
    let path = config.database_path();
    let ledger = Storage::open(&path)
        .with_context(|| format!("failed to open ledger at {}", path.display()))?;
    match cmd {
        LedgerCommand::Recent { limit, json } => {
            let records = ledger.recent(*limit)?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No logs sent yet.");
            } else {
                for record in &records {
                    println!(
                        "{}  {:<32} {:<4} {:>10} bytes",
                        record.sent_at.format("%Y-%m-%d %H:%M:%S"),
                        record.file_name,
                        record.origin,
                        record.size_bytes
                    );
                }
            }
        }
        LedgerCommand::Stats { json } => {
            let stats = ledger.stats()?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Ledger:          {}", path.display());
                println!("Logs sent:       {}", stats.total_transfers);
                println!("Bytes sent:      {}", stats.total_bytes);
                if let Some(oldest) = stats.oldest_sent {
                    println!("Oldest send:     {}", oldest.to_rfc3339());
                }
                if let Some(newest) = stats.newest_sent {
                    println!("Newest send:     {}", newest.to_rfc3339());
                }
                println!("Database size:   {} bytes", stats.db_size_bytes);
            }
        }
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: &ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if *json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[GPIO]");
                println!("  Backend:            {}", config.gpio.backend);
                println!("  Power-fault pin:    {}", config.gpio.power_fault_pin);
                println!("  UPS-online pin:     {}", config.gpio.ups_online_pin);
                println!("  Heartbeat pin:      {}", config.gpio.heartbeat_pin);
                println!();
                println!("[Power]");
                println!("  Poll interval (ms): {}", config.power.poll_interval_ms);
                println!("  Debounce samples:   {}", config.power.debounce_samples);
                println!("  Drain deadline (ms):{}", config.power.drain_deadline_ms);
                println!();
                println!("[Sync]");
                println!("  Enabled:            {}", config.sync.enabled);
                println!("  Watch dir:          {}", config.watch_dir().display());
                println!("  Outbox dir:         {}", config.outbox_dir().display());
                println!("  File pattern:       {}", config.sync.file_pattern);
                println!();
                println!("[Storage]");
                println!("  Ledger:             {}", config.database_path().display());
                println!("  Status file:        {}", config.status_path().display());
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { .. } => {}
    }
    Ok(())
}

fn handle_validate(file: Option<std::path::PathBuf>) -> anyhow::Result<ExitCode> {
    let path = file.unwrap_or_else(Config::default_config_path);
    println!("Validating configuration: {}", path.display());
    match Config::load_from(Some(path)) {
        Ok(_) => {
            println!("Configuration is valid.");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("Configuration error: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}
