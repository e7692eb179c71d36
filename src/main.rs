//! natrelay - reverse tunnel relay
//!
//! `natrelay server` runs the public relay; `natrelay client` keeps tunnels
//! registered with it and serves their sessions from local services.

mod cli;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use natrelay_client::{
    build_tls_connector, ClientConfig, TunnelDescriptor, TunnelObserver,
};
use natrelay_control::{load_tls_acceptor, RelayServer};
use natrelay_proto::TunnelRequest;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, ClientSettings, Commands, ServerSettings};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Server(args) => {
            let settings = args.resolve()?;
            runtime(settings.workers)?.block_on(run_server(settings))
        }
        Commands::Client(args) => {
            let settings = args.resolve()?;
            runtime(settings.workers)?.block_on(run_client(settings))
        }
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn runtime(workers: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = workers.filter(|w| *w > 0) {
        builder.worker_threads(workers);
    }
    builder
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")
}

async fn run_server(settings: ServerSettings) -> Result<()> {
    let tls = match (&settings.tls_cert, &settings.tls_key) {
        (Some(cert), Some(key)) => {
            Some(load_tls_acceptor(cert, key).context("Failed to load TLS certificate")?)
        }
        _ => None,
    };

    let server = RelayServer::bind(settings.server.clone(), tls)
        .await
        .context("Failed to start relay server")?;

    info!("natrelay server starting");
    if let Some(addr) = server.control_addr() {
        info!("Control listener: {}", addr);
    }
    if let Some(addr) = server.tls_control_addr() {
        info!("TLS control listener: {}", addr);
    }
    if let Some(addr) = server.http_addr() {
        info!("HTTP listener: {}", addr);
    }
    if let Some(addr) = server.https_addr() {
        info!("HTTPS listener: {}", addr);
    }
    info!("TCP tunnel ports: {}", settings.server.port_range);
    if settings.server.auth_token.is_none() {
        warn!("No auth token configured, any client may register tunnels");
    }

    let shutdown = CancellationToken::new();
    let serving = tokio::spawn(server.run(shutdown.clone()));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping listeners..."),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
    shutdown.cancel();
    serving.await.context("Relay server task failed")?;

    info!("natrelay server stopped");
    Ok(())
}

/// Logs every tunnel transition
struct LogObserver {
    label: String,
}

impl TunnelObserver for LogObserver {
    fn on_connecting(&self, reconnect: bool) {
        if reconnect {
            info!("[{}] Reconnecting", self.label);
        } else {
            info!("[{}] Connecting", self.label);
        }
    }

    fn on_connected(&self, request: &TunnelRequest) {
        info!(
            "[{}] Tunnel ready: {} -> {}",
            self.label,
            request.public_endpoint(),
            request.local_endpoint()
        );
    }

    fn on_disconnect(&self, error: bool, cause: &str) {
        if error {
            warn!("[{}] Disconnected: {}", self.label, cause);
        } else {
            info!("[{}] Disconnected: {}", self.label, cause);
        }
    }
}

async fn run_client(settings: ClientSettings) -> Result<()> {
    let mut config = ClientConfig::new(settings.server_host.clone(), settings.server_port)
        .with_encryption(settings.encrypt)
        .with_compression(settings.compress)
        .with_retry(settings.retry)
        .with_backoff(settings.backoff);
    if settings.tls {
        let connector = build_tls_connector(settings.ca_cert.as_deref())
            .context("Failed to set up TLS")?;
        config = config.with_tls(connector);
    }
    if let Some(name) = &settings.tls_server_name {
        config = config.with_tls_server_name(name.clone());
    }

    info!(
        "natrelay client starting: {} tunnel(s) via {}",
        settings.tunnels.len(),
        config.server_addr()
    );

    let descriptors: Vec<TunnelDescriptor> = settings
        .tunnels
        .into_iter()
        .map(|request| {
            let label = request
                .name
                .clone()
                .unwrap_or_else(|| request.local_endpoint());
            TunnelDescriptor::with_observer(config.clone(), request, Arc::new(LogObserver { label }))
        })
        .collect();
    for descriptor in &descriptors {
        descriptor.start();
    }

    let all_finished = async {
        for descriptor in &descriptors {
            descriptor.join().await;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Shutdown signal received, closing tunnels..."),
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
        }
        _ = all_finished => {
            info!("All tunnels stopped");
        }
    }

    for descriptor in &descriptors {
        descriptor.shutdown();
    }
    for descriptor in &descriptors {
        descriptor.join().await;
    }

    let failed: Vec<String> = descriptors
        .iter()
        .filter_map(|d| d.last_error())
        .collect();
    info!("natrelay client stopped");
    if descriptors.iter().all(|d| d.confirmed_request().is_none()) && !failed.is_empty() {
        anyhow::bail!("No tunnel could be established: {}", failed.join("; "));
    }
    Ok(())
}
