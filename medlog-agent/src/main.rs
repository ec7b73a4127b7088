//! medlog-agent - device log upload agent
//!
//! Watches the configured folders for device log bundles and uploads new
//! payload files to the ingestion server. Runs until Ctrl+C or SIGTERM.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use medlog_agent::agent::{start_agent, AgentTimings};
use medlog_agent::services::ingest_client::IngestClient;
use medlog_common::config::{load_or_create, resolve_config_path, AgentConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for medlog-agent
#[derive(Parser, Debug)]
#[command(name = "medlog-agent")]
#[command(about = "Uploads device log bundles to the ingestion server")]
#[command(version)]
struct Args {
    /// Configuration file (TOML); created with defaults when missing
    #[arg(short, long, env = "MEDLOG_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `data_dir` from the configuration file
    #[arg(long, env = "MEDLOG_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = resolve_config_path(args.config.as_deref())
        .context("Failed to resolve configuration path")?;
    let mut config = load_or_create(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = Some(data_dir);
    }

    init_tracing(&config)?;

    info!("Starting medlog-agent");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Config: {}", config_path.display());
    info!("Data dir: {}", config.data_dir().display());
    if config.watch_paths.is_empty() {
        tracing::warn!("No watch paths configured; nothing will be uploaded");
    }

    let api = Arc::new(
        IngestClient::new(&config)
            .context("Failed to build HTTP client")?
            .with_token_file(config_path.clone()),
    );
    let status_listen = config.status_listen_addr().map(str::to_string);

    let cancel = CancellationToken::new();
    let agent = start_agent(config, api, AgentTimings::default(), cancel.clone())
        .await
        .context("Failed to start agent")?;

    let server = match status_listen {
        Some(addr) => match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => {
                info!("Status API on http://{}/status", addr);
                let app = medlog_agent::build_router(agent.context.clone());
                let token = cancel.clone();
                Some(tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, app)
                        .with_graceful_shutdown(token.cancelled_owned())
                        .await
                    {
                        tracing::error!(error = %e, "Status API failed");
                    }
                }))
            }
            Err(e) => {
                tracing::warn!(addr = %addr, error = %e, "Status API disabled, could not bind");
                None
            }
        },
        None => None,
    };

    shutdown_signal().await;
    cancel.cancel();

    agent.shutdown().await;
    if let Some(server) = server {
        let _ = server.await;
    }
    info!("Shutdown complete");
    Ok(())
}

/// stdout plus, when enabled, an append-mode `client.log` in the data dir.
/// `RUST_LOG` overrides `[logging] level`.
fn init_tracing(config: &AgentConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tower_http=info", config.logging.level)));

    let file_layer = if config.logging.file {
        let path = config.log_file_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
