//! Worker binary entrypoint.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use rivulet_telemetry::LoggingConfig;
use rivulet_torrent_core::sim::SimTorrentEngine;
use rivulet_worker::transcode::hls::FfmpegSegmenter;
use rivulet_worker::worker::WorkerNode;
use tracing::error;

/// Rivulet worker node.
#[derive(Debug, Parser)]
#[command(name = "rivulet-worker", version, about)]
struct Cli {
    /// Gateway WebSocket URL.
    #[arg(long)]
    gateway: Option<String>,
    /// Worker node id (generated and persisted on first run if empty).
    #[arg(long)]
    id: Option<String>,
    /// Worker display name.
    #[arg(long)]
    name: Option<String>,
    /// Configuration file path.
    #[arg(long, default_value = "config/worker.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(install_error) = rivulet_telemetry::init_logging(&LoggingConfig::default()) {
        eprintln!("failed to initialise logging: {install_error}");
        std::process::exit(1);
    }

    if let Err(startup_error) = run(cli).await {
        error!(error = %startup_error, "worker failed to start");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = rivulet_config::load_worker_config(&cli.config)?;
    if let Some(gateway) = cli.gateway {
        config.gateway.url = gateway;
    }
    if let Some(id) = cli.id {
        config.node.id = id;
    }
    if let Some(name) = cli.name {
        config.node.name = name;
    }
    config.validate()?;

    let engine = Arc::new(SimTorrentEngine::default());
    let segmenter = Arc::new(FfmpegSegmenter::new());
    let worker = WorkerNode::build(config, engine, segmenter).await?;
    worker.run().await
}
