//! Pulse Node
//!
//! Hosts a Proof-of-Life ledger in-process: runs the collection round on a
//! timer and, with `--simulate`, drives it with synthetic wearable devices.
//!
//! Usage:
//!   pulse-node [OPTIONS]

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pulse_ledger::{
    consensus::{current_time_ms, ConsensusConfig, ProofOfLife},
    crypto::Keypair,
    node::NodeHandle,
    storage::Storage,
    types::{Heartbeat, Motion},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a Proof-of-Life ledger node")]
struct Cli {
    /// JSON file with consensus parameters; flags below override it
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Persist the chain here; in-memory only when omitted
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Minimum live participants per block
    #[arg(long)]
    threshold: Option<usize>,

    /// Block interval in milliseconds
    #[arg(long)]
    interval: Option<u64>,

    /// Base reward per block
    #[arg(long)]
    reward: Option<f64>,

    /// Generate heartbeats from simulated devices
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Number of simulated devices
    #[arg(long, default_value_t = 3)]
    devices: usize,
}

impl Cli {
    fn consensus_config(&self) -> anyhow::Result<ConsensusConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => ConsensusConfig::default(),
        };

        if let Some(n) = self.threshold {
            config.n_threshold = n;
        }
        if let Some(ms) = self.interval {
            config.block_interval_ms = ms;
        }
        if let Some(reward) = self.reward {
            config.reward_per_block = reward;
        }
        anyhow::ensure!(config.block_interval_ms > 0, "block interval must be positive");
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = cli.consensus_config()?;

    println!(r#"
    ╔═══════════════════════════════════════════════════════════╗
    ║                                                           ║
    ║   🫀  PULSE LEDGER NODE                                   ║
    ║       Proof-of-Life Consensus                             ║
    ║                                                           ║
    ╚═══════════════════════════════════════════════════════════╝
    "#);

    info!("Starting Pulse Node...");
    info!("  Threshold: {} participants", config.n_threshold);
    info!("  Block Interval: {}ms", config.block_interval_ms);
    info!("  Block Reward: {} PULSE", config.reward_per_block);

    let pol = match &cli.data_dir {
        Some(dir) => {
            info!("  Data Dir: {}", dir.display());
            let storage = Storage::open(dir)
                .with_context(|| format!("opening storage at {}", dir.display()))?;
            ProofOfLife::with_storage(config.clone(), Arc::new(storage))?
        }
        None => {
            info!("  Data Dir: (in-memory)");
            ProofOfLife::new(config.clone())
        }
    };

    let node = NodeHandle::new(pol);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let producer = node.spawn_block_producer(
        Duration::from_millis(config.block_interval_ms),
        shutdown_rx.clone(),
    );

    let simulator = cli.simulate.then(|| {
        let node = node.clone();
        let devices = cli.devices;
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { simulate_heartbeats(node, devices, shutdown).await })
    });

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutting down...");
    let _ = shutdown_tx.send(true);

    producer.await?;
    if let Some(sim) = simulator {
        sim.await?;
    }

    let stats = node.snapshot().await;
    info!("Final chain length: {}", stats.chain_length);
    info!("Total minted: {:.4} PULSE", stats.total_minted);
    Ok(())
}

/// Simulate heartbeats for testing (when --simulate is passed)
async fn simulate_heartbeats(node: NodeHandle, count: usize, mut shutdown: watch::Receiver<bool>) {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    info!("🎭 Starting heartbeat simulation...");

    let devices: Vec<Keypair> = (0..count).map(|_| Keypair::generate()).collect();
    for (i, kp) in devices.iter().enumerate() {
        info!("  Device {}: {}...", i, &kp.public_key_hex()[..16]);
    }

    let mut interval = tokio::time::interval(Duration::from_secs(2));
    let mut rng = StdRng::from_entropy();

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => return,
        }

        for device in &devices {
            let activity: f64 = rng.gen_range(0.0..0.5);

            let mut hb = Heartbeat {
                timestamp: current_time_ms(),
                heart_rate: 70 + (activity * 60.0) as u16 + rng.gen_range(0..10),
                motion: Motion {
                    x: rng.gen_range(-0.2..0.2) + activity * 0.5,
                    y: rng.gen_range(-0.2..0.2) + activity * 0.3,
                    z: rng.gen_range(-0.1..0.1) + activity * 0.2,
                },
                temperature: 36.5 + rng.gen_range(-0.5..0.5),
                device_pubkey: device.public_key_hex(),
                signature: String::new(),
            };
            hb.signature = device.sign(&hb.signable_bytes());

            if let Err(e) = node.submit_heartbeat(hb).await {
                warn!("Simulated heartbeat rejected: {}", e);
            }
        }
    }
}
