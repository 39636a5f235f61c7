//! Tessera Devnet Binary
//!
//! Runs a local network of witness groups in one process: every witness is
//! a node service, and an in-process router stands in for the peer network.
//!
//! Usage:
//!   tessera --groups 3 --witnesses 4 --transfers 20 --duration 1m
//!   tessera --config devnet.toml

#![allow(missing_docs)]

mod devnet;

use clap::Parser;
use devnet::{Devnet, DevnetConfig};
use std::{path::PathBuf, time::Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// Tessera witness devnet
#[derive(Debug, Parser)]
#[command(name = "tessera")]
#[command(about = "Local devnet of Tessera witness groups")]
struct Args {
    /// TOML devnet config; flags override its values
    #[arg(long, short = 'c', env = "TESSERA_CONFIG")]
    config: Option<PathBuf>,

    /// Number of witness groups
    #[arg(long, short = 'g')]
    groups: Option<u32>,

    /// Witnesses per group
    #[arg(long, short = 'w')]
    witnesses: Option<usize>,

    /// Genesis coins to transfer once the network is up
    #[arg(long, short = 't')]
    transfers: Option<usize>,

    /// How long to run (e.g. "30s", "5m")
    #[arg(long, short = 'd')]
    duration: Option<humantime::Duration>,

    /// Seed for witness keys
    #[arg(long)]
    seed: Option<u64>,
}

impl Args {
    fn devnet_config(&self) -> eyre::Result<DevnetConfig> {
        let mut config = match &self.config {
            Some(path) => DevnetConfig::load(path)?,
            None => DevnetConfig::default(),
        };

        if let Some(groups) = self.groups {
            config.groups = groups;
        }
        if let Some(witnesses) = self.witnesses {
            config.witnesses_per_group = witnesses;
        }
        if let Some(transfers) = self.transfers {
            config.transfers = transfers;
        }
        if let Some(duration) = self.duration {
            config.duration = duration.into();
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tessera::consensus=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    let config = args.devnet_config()?;

    info!(
        target: "tessera::devnet",
        groups = config.groups,
        witnesses = config.witnesses_per_group,
        transfers = config.transfers,
        duration = %humantime::format_duration(config.duration),
        "Starting Tessera devnet"
    );

    let devnet = Devnet::launch(&config).await?;

    let deadline = tokio::time::sleep(config.duration);
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(deadline, interrupt);
    let mut progress = tokio::time::interval(PROGRESS_INTERVAL);
    progress.tick().await;
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = &mut interrupt => {
                info!(target: "tessera::devnet", "Interrupted");
                break;
            }
            _ = progress.tick() => {
                info!(target: "tessera::devnet", finalized = devnet.finalized(), "Progress");
            }
        }
    }
    let summary = devnet.shutdown().await;

    info!(
        target: "tessera::devnet",
        finalized = summary.finalized,
        rolled_back = summary.rolled_back,
        committed = summary.committed,
        bans = summary.bans,
        "Devnet stopped"
    );
    Ok(())
}
