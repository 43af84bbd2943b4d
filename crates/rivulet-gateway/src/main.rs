//! Gateway binary entrypoint.

use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use rivulet_config::GatewayAppConfig;
use rivulet_gateway::{GatewayState, http, spawn_sweeper};
use rivulet_telemetry::LoggingConfig;
use tracing::{info, warn};

/// Public broker for Rivulet workers and clients.
#[derive(Debug, Parser)]
#[command(name = "rivulet-gateway", version, about)]
struct Cli {
    /// Address to bind; overrides RIVULET_BIND_ADDR.
    #[arg(long)]
    bind: Option<std::net::IpAddr>,
    /// Port to bind; overrides RIVULET_HTTP_PORT.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    rivulet_telemetry::init_logging(&LoggingConfig::default())
        .context("failed to initialise logging")?;

    let mut config = GatewayAppConfig::from_env().context("invalid gateway environment")?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(port) = cli.port {
        config.http_port = port;
    }

    let state = GatewayState::new(&config);
    let sweeper = spawn_sweeper(state.clone());
    let app = http::router(state);

    let addr = SocketAddr::new(config.bind_addr, config.http_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("unable to bind {addr}"))?;
    info!(addr = %addr, turn_enabled = config.turn.enabled(), "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server failed")?;

    sweeper.abort();
    if let Err(error) = sweeper.await {
        if !error.is_cancelled() {
            warn!(error = %error, "sweeper join failed");
        }
    }
    info!("gateway shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}
