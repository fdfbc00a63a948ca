//! renter-sim - drive the renter engine against in-memory hosts
//!
//! Uploads a random file, takes some of its hosts away, waits for the
//! repair loop to restore full redundancy, then downloads and verifies the
//! file and prints the engine's counters as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use rand::RngCore;
use serde::Serialize;
use tracing::info;

use renter_core::{
    ContractTerms, FilePath, HostKey, MemoryFs, MemoryHost, Renter, RenterConfig, RenterStats,
    UsableHost,
};
use renter_telemetry::{init_logging, LogLevel};

#[derive(Parser)]
#[command(name = "renter-sim")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of simulated hosts
    #[arg(long, default_value_t = 12)]
    hosts: usize,

    /// Hosts holding pieces to take away after the upload
    #[arg(long, default_value_t = 2)]
    failing: usize,

    /// Data pieces per chunk (overrides the config file)
    #[arg(long)]
    data_pieces: Option<usize>,

    /// Parity pieces per chunk (overrides the config file)
    #[arg(long)]
    parity_pieces: Option<usize>,

    /// File size in bytes
    #[arg(long, default_value_t = 1 << 20)]
    size: usize,

    /// Chunk size in bytes (overrides the config file)
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Renter config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Give up waiting for repairs after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Serialize)]
struct Report {
    hosts: usize,
    hosts_removed: usize,
    health_after_loss: f64,
    health_after_repair: f64,
    repair_time_ms: u128,
    verified: bool,
    stats: RenterStats,
}

fn load_config(cli: &Cli) -> Result<RenterConfig> {
    let mut config = match &cli.config {
        Some(path) => RenterConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let mut config = RenterConfig::default();
            config.upload.data_pieces = 2;
            config.upload.parity_pieces = 4;
            config.upload.chunk_size = 256 * 1024;
            config.health.check_interval_secs = 5;
            config.repair.idle_interval_secs = 1;
            config.stuck.interval_secs = 1;
            config
        }
    };
    if let Some(k) = cli.data_pieces {
        config.upload.data_pieces = k;
    }
    if let Some(parity) = cli.parity_pieces {
        config.upload.parity_pieces = parity;
    }
    if let Some(size) = cli.chunk_size {
        config.upload.chunk_size = size;
    }
    config.log.level = match cli.verbose {
        0 => config.log.level,
        1 => LogLevel::Info,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(&config.log)?;

    let scheme = config.upload.scheme()?;
    if cli.hosts < scheme.num_pieces() + cli.failing {
        bail!(
            "{} hosts cannot hold {} pieces after losing {}",
            cli.hosts,
            scheme.num_pieces(),
            cli.failing
        );
    }

    let hosts: Vec<UsableHost> = (0..cli.hosts as u64)
        .map(|i| {
            let host = Arc::new(MemoryHost::new(HostKey::from_seed(i)));
            UsableHost::new(host.key(), ContractTerms::open(i), host)
        })
        .collect();

    let fs = Arc::new(MemoryFs::new());
    let renter = Renter::new(config, fs.clone())?;
    renter.reconcile(&hosts);
    renter.start();

    let mut data = vec![0u8; cli.size];
    rand::thread_rng().fill_bytes(&mut data);
    let data = Bytes::from(data);
    let path = FilePath::parse("sim/random.bin").context("invalid file path")?;

    info!(size = cli.size, hosts = cli.hosts, "Uploading file");
    let file = renter.upload_file(path.clone(), data.clone(), scheme).await?;
    fs.remove_local(&path);

    let doomed: Vec<HostKey> = file.chunks[0]
        .pieces
        .iter()
        .map(|p| p.host)
        .take(cli.failing)
        .collect();
    let remaining: Vec<UsableHost> = hosts
        .into_iter()
        .filter(|h| !doomed.contains(&h.key))
        .collect();
    info!(removed = doomed.len(), "Removing hosts");
    renter.reconcile(&remaining);

    let health_after_loss = renter.file_health(&path).await?.health;
    let started = Instant::now();
    let deadline = started + Duration::from_secs(cli.timeout_secs);
    let health_after_repair = loop {
        let health = renter.file_health(&path).await?.health;
        if health == 0.0 || Instant::now() >= deadline {
            break health;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    let repair_time_ms = started.elapsed().as_millis();

    let downloaded = renter.download_range(&path, 0, data.len() as u64).await?;
    let verified = downloaded == data;
    renter.shutdown().await;

    let report = Report {
        hosts: cli.hosts,
        hosts_removed: doomed.len(),
        health_after_loss,
        health_after_repair,
        repair_time_ms,
        verified,
        stats: renter.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !verified {
        bail!("downloaded data does not match the upload");
    }
    Ok(())
}
