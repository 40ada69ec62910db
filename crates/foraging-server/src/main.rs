//! Console host for the foraging experiment coordinator
//!
//! Reads JSON-encoded inbound commands from stdin, one per line, and writes
//! every outbound envelope to stdout as a JSON line. Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Default single round
//! foraging-server
//!
//! # Experiment schedule from TOML, reproducible group shuffles
//! FORAGING_CONFIG=./experiment.toml foraging-server --seed 7
//! ```
//!
//! Besides JSON commands such as
//! `{"from":1,"command":{"type":"register"}}`, stdin accepts the facilitator
//! shortcuts `clients`, `skip`, `skip-quiz`, `start-round` and
//! `skip-post-round-sanction`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use foraging_coordination::{
    Coordinator, CoordinatorHandle, EventBus, EventLog, ExperimentConfig, Inbound, RoundState,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Experiment schedule (TOML). Defaults to a single default round.
    #[arg(long, env = "FORAGING_CONFIG")]
    config: Option<PathBuf>,

    /// Seed for group shuffles, monitor picks and tie-breaks
    #[arg(long)]
    seed: Option<u64>,

    /// Scheduling tick in milliseconds (overrides the config file)
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Append-only JSON-lines event log (overrides the config file)
    #[arg(long)]
    event_log: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<ExperimentConfig> {
    let mut config = match &args.config {
        Some(path) => ExperimentConfig::load(path)
            .with_context(|| format!("failed to load experiment config {}", path.display()))?,
        None => ExperimentConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.seed = Some(seed);
    }
    if let Some(tick_ms) = args.tick_ms {
        config.tick_ms = tick_ms;
    }
    if let Some(path) = &args.event_log {
        config.event_log_path = Some(path.clone());
    }
    config.validate().context("invalid experiment config")?;
    Ok(config)
}

async fn handle_line(handle: &CoordinatorHandle, line: &str) {
    match line {
        "" => {}
        "clients" => {
            let ids = handle.participants().await;
            info!(count = ids.len(), ?ids, "Connected participants");
        }
        "skip" => handle.skip(),
        "skip-quiz" => handle.skip_quiz(),
        "start-round" => handle.start_round(),
        "skip-post-round-sanction" => handle.skip_post_round_sanction(),
        _ => match serde_json::from_str::<Inbound>(line) {
            Ok(inbound) => {
                if let Err(e) = handle.submit(inbound).await {
                    warn!(error = %e, "Command rejected");
                }
            }
            Err(e) => warn!(error = %e, input = line, "Unrecognized input"),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    info!(
        rounds = config.rounds.len(),
        tick_ms = config.tick_ms,
        seed = ?config.seed,
        "Starting foraging server"
    );

    let persister = match &config.event_log_path {
        Some(path) => EventLog::with_file(path.clone()),
        None => EventLog::in_memory(),
    };
    let bus = EventBus::new().shared();
    let mut outbound = bus.subscribe();
    let state = RoundState::new(config, bus.clone(), Box::new(persister));
    let coordinator = Coordinator::new(state);
    let handle = coordinator.handle();

    tokio::spawn(async move {
        loop {
            match outbound.recv().await {
                Ok(envelope) => match serde_json::to_string(&envelope) {
                    Ok(json) => println!("{json}"),
                    Err(e) => error!(error = %e, "Failed to encode envelope"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Outbound writer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut run = tokio::spawn(async move { coordinator.run().await });
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            result = &mut run => {
                result.context("coordinator task panicked")??;
                info!("Experiment finished");
                return Ok(());
            }
            line = lines.next_line() => match line.context("failed to read stdin")? {
                Some(line) => handle_line(&handle, line.trim()).await,
                None => {
                    info!("Stdin closed, waiting for the experiment to finish");
                    run.await.context("coordinator task panicked")??;
                    return Ok(());
                }
            },
        }
    }
}
