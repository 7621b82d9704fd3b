//! veripeer-node: peer daemon. Listens for verification requests and registers with a tracker.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use veripeer_node::{config, Node};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Listen host
    #[arg(long)]
    host: Option<String>,
    /// Listen port (0 lets the OS pick)
    #[arg(long, short)]
    port: Option<u16>,
    /// Tracker base URL
    #[arg(long)]
    tracker: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut cfg = match &cli.config {
        Some(path) => config::load_from(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => config::load(),
    };
    if let Some(host) = cli.host {
        cfg.host = host;
    }
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    if let Some(url) = cli.tracker {
        cfg.tracker_url = Some(url);
    }

    let node = Node::bind(&cfg).await.context("failed to start node")?;
    tracing::info!(id = %node.id(), addr = %node.address(), "veripeer-node starting");

    if let Some(url) = &cfg.tracker_url {
        if let Err(e) = node.register_url(url).await {
            tracing::warn!(error = %e, tracker = %url, "tracker registration failed");
        }
    }

    let accept_loop = node.spawn();
    shutdown_signal().await?;
    tracing::info!("shutting down");

    if node.is_registered().await {
        if let Err(e) = node.deregister().await {
            tracing::warn!(error = %e, "tracker deregistration failed");
        }
    }
    node.kill().await;
    accept_loop.await??;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
