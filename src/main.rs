//! ESP32 word clock WebSocket simulator
//!
//! Stands in for the clock's firmware so client apps can be developed without
//! the hardware. Reports a fixed temperature, settings and schedule and
//! answers the settings and temperature-mode commands.

mod config;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{Overrides, SimulatorConfig};
use server::WebSocketServer;

/// ESP32 word clock WebSocket simulator
#[derive(Parser, Debug)]
#[command(name = "esp32-ws-sim")]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on [default: 81]
    #[arg(short, long)]
    port: Option<u16>,

    /// WebSocket endpoint path [default: /ws]
    #[arg(long)]
    path: Option<String>,

    /// Reject connections beyond this many concurrent clients
    #[arg(long)]
    max_connections: Option<usize>,

    /// Close connections that stay silent for this many seconds
    #[arg(long, value_name = "SECS")]
    idle_timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("ESP32 WebSocket simulator v{}", env!("CARGO_PKG_VERSION"));

    let config = SimulatorConfig::load_or_default(args.config.as_deref())?.apply(Overrides {
        bind: args.bind,
        port: args.port,
        path: args.path,
        max_connections: args.max_connections,
        idle_timeout_secs: args.idle_timeout,
    });
    config.validate()?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {}", path.display());
    }

    let listen = &config.server;
    let url = server::endpoint_url(server::local_ip().await, listen.port, &listen.path);
    info!("Starting simulator on {}", url);
    info!("(Bound to {})", listen.bind);

    if let Some(limit) = listen.max_connections {
        info!("Accepting at most {} concurrent connections", limit);
    }
    if let Some(secs) = listen.idle_timeout_secs {
        info!("Closing connections idle for {}s", secs);
    }

    let server = Arc::new(WebSocketServer::new(config.server_config()));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
