use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use icmpmon_core::{ControlPlane, ControlPlaneConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "control-plane", author, version, about = "icmp-mon control plane")]
struct Args {
    /// Configuration file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bearer token required from agents and operators
    #[arg(long)]
    token: Option<String>,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    let mut config = ControlPlaneConfig::load_from_path(args.config.as_ref())?;
    if let Some(token) = args.token {
        config.http.token = Some(token);
    }
    let log_level = if args.debug {
        "debug".to_string()
    } else {
        config.observability.log_level.clone()
    };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    info!("starting icmp-mon control plane");
    let handle = ControlPlane::new(config).start().await?;

    shutdown_signal().await;
    info!("shutdown signal received");
    handle.shutdown().await?;
    info!("control plane stopped");
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
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
