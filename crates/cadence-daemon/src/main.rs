use std::sync::Arc;

use cadence_core::CadenceConfig;
use cadence_scheduler::{Clock, CompletionListener, SystemClock};
use clap::{Parser, Subcommand};
use tracing::info;

mod app;
mod bridge;

/// Buffered worker events between the stdin reader and the completion listener.
const EVENT_BUFFER: usize = 1_024;

#[derive(Parser)]
#[command(name = "cadence-daemon", version, about = "Job scheduling and execution-tracking daemon")]
struct Cli {
    /// Path to cadence.toml (defaults to $CADENCE_CONFIG, then ~/.cadence/cadence.toml).
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the trigger, janitor and worker bridge until Ctrl-C (default).
    Serve,
    /// Backfill missing next_run values and fail orphaned runs, then exit.
    Repair,
    /// Run a single janitor sweep, then exit.
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries dispatched work; logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_daemon=info,cadence_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();
    // config: --config > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = cli.config.or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let config = CadenceConfig::load(config_path.as_deref())?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (app, lanes) = app::App::build(&config, clock.clone())?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Repair => {
            app.repair()?;
            return Ok(());
        }
        Command::Sweep => {
            let report = app.janitor.sweep()?;
            info!(
                stale = report.stale_failed.len(),
                expired = report.expired_failed.len(),
                purged = report.purged,
                "sweep complete"
            );
            return Ok(());
        }
        Command::Serve => {}
    }

    app.repair()?;
    let app::App {
        trigger,
        janitor,
        runs,
        ..
    } = app;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let (event_tx, event_rx) = tokio::sync::mpsc::channel(EVENT_BUFFER);

    let tasks = vec![
        tokio::spawn(trigger.clone().run(shutdown_rx.clone())),
        tokio::spawn(janitor.run(shutdown_rx.clone())),
        tokio::spawn(CompletionListener::new(runs).run(event_rx, shutdown_rx.clone())),
        tokio::spawn(bridge::forward_lanes(lanes, clock, shutdown_rx)),
    ];
    bridge::read_events(event_tx)?;
    // one-shots created just before a previous crash; lanes are drained by now
    trigger.fire_unfired_one_shots().await?;
    info!("cadence daemon running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
