use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use keepstore::{DriverRegistry, Keepstore, KeepstoreConfig};
use keepstore_server::cli::{Cli, Command};
use keepstore_server::source::HttpBlockSource;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    keepstore_server::init_tracing(cli.log_json);

    let registry = DriverRegistry::default();
    match cli.command() {
        Command::Drivers => {
            for driver in registry.drivers() {
                println!("{}", driver);
            }
            Ok(())
        }
        Command::CheckConfig => {
            let config = load_config(&cli)?;
            let node = Keepstore::new(config, &registry)?;
            println!("{}", serde_json::to_string_pretty(&node.mounts())?);
            Ok(())
        }
        Command::Serve => serve(&cli, &registry).await,
    }
}

fn load_config(cli: &Cli) -> Result<KeepstoreConfig> {
    KeepstoreConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))
}

async fn serve(cli: &Cli, registry: &DriverRegistry) -> Result<()> {
    let config = load_config(cli)?;
    let source = Arc::new(HttpBlockSource::new(config.pull_timeout())?);
    let node = Keepstore::new(config, registry)?;

    tracing::info!(config = %cli.config.display(), mounts = node.mounts().len(), "keepstore starting");

    let cancel = CancellationToken::new();
    let workers = node.spawn_workers(source, &cancel);

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("shutting down");

    cancel.cancel();
    node.shutdown().await;
    for handle in workers {
        if let Err(e) = handle.await {
            tracing::error!("worker task failed: {}", e);
        }
    }
    Ok(())
}
