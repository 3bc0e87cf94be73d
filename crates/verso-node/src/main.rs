use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use verso_ident::{bootstrap, NodeLeaseRegistry, SystemClock, TuidAllocator};
use verso_storage::{FjallLeases, FjallStore, FjallTables, TtlSweeper};

#[derive(clap::Parser, Debug)]
#[command(name = "verso-node", about = "Verso versioned entity store node")]
struct Cli {
    /// Process identity used for the node id lease (e.g. bound address)
    #[arg(long)]
    identity: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    data_dir: PathBuf,
    ttl_sweep_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
struct LeaseConfig {
    identity: String,
    acquire_attempts: usize,
}

#[derive(Debug, Deserialize)]
struct AllocatorConfig {
    max_wait_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    storage: StorageConfig,
    lease: LeaseConfig,
    allocator: AllocatorConfig,
    observability: ObservabilityConfig,
}

/// `--identity`, then `lease.identity`, then the host name.
fn resolve_identity(cli: &Cli, config: &LeaseConfig) -> anyhow::Result<String> {
    if let Some(ref identity) = cli.identity {
        return Ok(identity.clone());
    }
    if !config.identity.is_empty() {
        return Ok(config.identity.clone());
    }
    if let Ok(host) = std::env::var("HOSTNAME") {
        if !host.trim().is_empty() {
            return Ok(host.trim().to_string());
        }
    }
    let host = std::fs::read_to_string("/etc/hostname")
        .context("no --identity given and host name is unavailable")?;
    anyhow::ensure!(!host.trim().is_empty(), "no --identity given and host name is empty");
    Ok(host.trim().to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment = Figment::new()
        .merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let config: Config = figment
        .merge(Env::prefixed("VERSO_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    let identity = resolve_identity(&cli, &config.lease)?;
    let data_dir = cli.data_dir.clone().unwrap_or(config.storage.data_dir);
    tracing::info!(identity = %identity, data_dir = %data_dir.display(), "node starting");

    let store = FjallStore::open(&data_dir)
        .with_context(|| format!("failed to open storage at {}", data_dir.display()))?;

    let clock = Arc::new(SystemClock);
    let registry = NodeLeaseRegistry::new(FjallLeases(store.clone()), clock.clone(), config.lease.acquire_attempts);
    let allocator = Arc::new(TuidAllocator::new(clock, Duration::from_millis(config.allocator.max_wait_ms)));
    let node_id = bootstrap(&registry, &allocator, &identity)
        .await
        .with_context(|| format!("failed to lease a node id for {identity}"))?;

    tracing::info!(node_id, "node ready");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let sweeper = TtlSweeper::new(
        Arc::new(FjallTables(store.clone())),
        Duration::from_secs(config.storage.ttl_sweep_interval_secs.max(1)),
        shutdown_rx,
    );
    let sweeper = tokio::spawn(sweeper.run());

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!(node_id, "shutting down");
    let _ = shutdown_tx.send(true);
    sweeper.await.context("ttl sweeper panicked")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_extract() {
        let config: Config = Figment::new()
            .merge(Toml::string(include_str!("../../../config/default.toml")))
            .extract()
            .unwrap();
        assert_eq!(config.lease.acquire_attempts, 8);
        assert_eq!(config.allocator.max_wait_ms, 100);
        assert!(config.lease.identity.is_empty());
        assert_eq!(config.observability.log_format, "json");
    }
}
