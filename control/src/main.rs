//! upstream-sync
//!
//! Watches Kubernetes nodes and keeps an nginx `upstream` block pointing at
//! every (optionally filtered) node's InternalIP on the service's node port,
//! reloading nginx after each rewrite.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use upstream_sync::apis::cluster_state::KubeClusterApi;
use upstream_sync::apis::node_watcher::{KubeNodeEvents, NodeWatcher};
use upstream_sync::config::{Cli, LogFormat, SyncConfig};
use upstream_sync::reconciler::{Reconcile, Reconciler};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (needed for Kubernetes TLS client)
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok(); // Ignore error if already installed

    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = Arc::new(SyncConfig::load(&cli).context("Invalid configuration")?);
    info!(
        namespace = %config.namespace,
        service = %config.service_name,
        port_name = ?config.port_name,
        upstream_conf = %config.upstream_conf.display(),
        reload_cmd = ?config.reload_cmd,
        label_selector = ?config.label_filter().selector(),
        ignore_not_ready = config.ignore_not_ready,
        "Starting upstream-sync"
    );

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let reconciler = Reconciler::new(KubeClusterApi::new(client.clone()), config.clone());

    // Initial sync must succeed before watching
    tokio::select! {
        result = reconciler.reconcile() => {
            let report = result.context("Initial sync failed")?;
            info!(
                "Initial sync complete: {} servers on port {}",
                report.upstreams.len(),
                report.port
            );
        }
        _ = shutdown_rx.changed() => {
            info!("Shutdown requested before initial sync completed");
            return Ok(());
        }
    }

    let events = KubeNodeEvents::new(client, config.watch_timeout_secs);
    NodeWatcher::new(events, reconciler, config.watch_backoff)
        .run(shutdown_rx)
        .await;

    info!("upstream-sync shutdown complete");
    Ok(())
}
