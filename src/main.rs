use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::{LogFormat, TurnstileConfig};
use turnstile::gatekeeper::Gatekeeper;
use turnstile::http::HttpServer;

/// Request throttling and brute-force protection service.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "TURNSTILE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the HTTP bind address
    #[arg(long, env = "TURNSTILE_BIND")]
    bind: Option<SocketAddr>,

    /// Override the log level (ignored when RUST_LOG is set)
    #[arg(long, env = "TURNSTILE_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    if let Some(level) = args.log_level {
        config.server.log_level = level;
    }

    init_tracing(&config);

    info!("Starting Turnstile protection service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        bind_addr = %config.server.bind_addr,
        policy_path = ?config.policy.path,
        "Configuration loaded"
    );

    let gatekeeper = Arc::new(Gatekeeper::from_config(&config));
    gatekeeper.start_sweeper();
    info!("Gatekeeper initialized");

    let server = HttpServer::new(config.server.bind_addr, Arc::clone(&gatekeeper));

    // Run the server with graceful shutdown on Ctrl+C
    let served = server.serve_with_shutdown(shutdown_signal()).await;
    gatekeeper.shutdown();
    served?;

    info!("Turnstile protection service stopped");
    Ok(())
}

fn init_tracing(config: &TurnstileConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match config.server.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
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
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
