//! Mediation worker CLI.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use anyhow::Context;
use clap::{Parser, Subcommand};
use intent_mediator::{EventSink, MediationEngine, MediatorConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "intent-mediator")]
#[command(about = "Mediation worker for intent ledgers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory for the vector index and reputation cache
    #[arg(long, env = "MEDIATOR_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the mediation engine until interrupted
    Run,
    /// Probe the configured ledger and print its health
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = MediatorConfig::from_env().context("loading configuration")?;
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Health => health(config).await,
    }
}

async fn run(config: MediatorConfig) -> anyhow::Result<()> {
    let engine = MediationEngine::new(config, EventSink::disabled())
        .context("initialising mediation engine")?;

    let signal_engine = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_engine.shutdown();
        }
    });

    engine.run().await.context("running mediation engine")?;
    Ok(())
}

async fn health(config: MediatorConfig) -> anyhow::Result<()> {
    let engine =
        MediationEngine::new(config, EventSink::disabled()).context("initialising engine")?;
    let chain_ok = engine.adapter().health().await.unwrap_or(false);
    let health = engine.health();
    println!("chain reachable: {chain_ok}");
    if chain_ok {
        match engine.adapter().validate_chain().await {
            Ok((valid, issues)) => {
                println!("chain valid: {valid}");
                for issue in issues {
                    println!("  issue: {issue}");
                }
            }
            Err(err) => println!("chain validation unavailable: {err}"),
        }
    }
    println!("circuit breaker: {}", health.circuit_state);
    println!("reputation weight: {:.3}", health.reputation_weight);
    if !chain_ok {
        std::process::exit(1);
    }
    Ok(())
}
