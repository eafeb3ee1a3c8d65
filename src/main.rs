use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};

use bridle::config;
use bridle::error::Result;
use bridle::server::ProxyServer;
use bridle::state::AppState;
use bridle::web;

#[derive(Parser, Debug)]
#[command(name = "bridle")]
#[command(about = "A filtering reverse proxy for the Docker Engine API", long_about = None)]
struct Args {
    /// Path to configuration file (TOML/JSON/YAML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory scanned for plugin modules and script filters
    #[arg(short, long, value_name = "DIR")]
    plugins: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("bridle={log_level}").parse().unwrap()),
        )
        .init();

    let mut config = match args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_from_path(&path)?
        }
        None => config::load_from_env_or_file()?,
    };
    if let Some(dir) = args.plugins {
        config.plugins.dir = dir;
    }

    info!("Starting bridle");
    info!(
        "Proxying {} -> {}",
        config.proxy.addr(),
        config.backend.addr()
    );

    let state = AppState::new(config);

    let snapshot = state.registry.load();
    info!(
        "Loaded {} filters and {} script capabilities from {}",
        snapshot.filters.len(),
        snapshot.script_capabilities.len(),
        state.config.plugins.dir.display()
    );

    let web_handle = if state.config.admin.enabled {
        let web_state = state.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = web::run(web_state).await {
                error!("Admin server error: {}", e);
            }
        }))
    } else {
        None
    };

    let proxy = ProxyServer::new(state.clone());
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!("Proxy server error: {}", e);
        }
    });

    shutdown_signal().await;

    info!("Shutting down bridle");
    proxy_handle.abort();
    if let Some(handle) = web_handle {
        handle.abort();
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
