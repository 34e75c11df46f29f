//! snipboxd - HTTP front end for the snipbox execution engine
//!
//! Accepts `POST /run` with a code snippet, executes it in a fresh sandboxed
//! workspace and answers with `{ success, output, error }`.

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use snipbox_core::Coordinator;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod server;

use config::DaemonConfig;

#[derive(Debug, Parser)]
#[command(name = "snipboxd", version, about = "Sandboxed code execution server")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file and SNIPBOX_LISTEN
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("snipbox=info".parse()?))
        .init();

    let args = Args::parse();
    tracing::info!("snipboxd starting");

    let mut config = DaemonConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    tracing::info!(
        listen = %config.listen,
        slots = config.sandbox.max_concurrent,
        origin = ?config.allowed_origin,
        "configuration loaded"
    );

    let coordinator = Arc::new(
        Coordinator::new(config.sandbox.clone()).context("initializing execution engine")?,
    );
    let app = server::router(coordinator, &config)?;

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    tracing::info!(addr = %config.listen, "listening");

    server::serve(listener, app, shutdown_signal()).await?;
    tracing::info!("snipboxd stopped");
    Ok(())
}

/// Resolves on the first SIGTERM or SIGINT
async fn shutdown_signal() {
    let mut signals = match Signals::new([SIGTERM, SIGINT]) {
        Ok(signals) => signals,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install signal handlers");
            return std::future::pending().await;
        }
    };
    if let Some(signal) = signals.next().await {
        tracing::info!(signal, "shutdown requested, draining in-flight requests");
    }
}
