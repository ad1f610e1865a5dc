//! Reconciliation cycle
//!
//! One cycle converges the nginx upstream file to the current cluster state:
//!
//! 1. Resolve the service port and the filtered node addresses
//! 2. Build the upstream set (zero nodes is an error, never an empty block)
//! 3. Atomically write the upstream file
//! 4. Run the reload command
//!
//! Any step's failure aborts the cycle. Nothing is rolled back: the file write
//! is atomic, and a failed reload leaves the freshly written file in place.
//! Cycles keep no state between runs, so repeating one with unchanged cluster
//! state rewrites identical bytes and reloads again, which is harmless.

use crate::apis::cluster_state::{list_node_addresses, resolve_port, ClusterApi};
use crate::apis::metrics::{record_reconciliation, set_upstream_members};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::reload::ReloadCommand;
use crate::upstream_conf::write_upstream_conf;
use async_trait::async_trait;
use common::{ResolvedPort, UpstreamSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Summary of a successful cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub port: ResolvedPort,
    /// `ip:port` entries written, in order
    pub upstreams: Vec<String>,
    pub path: PathBuf,
}

/// Something that can run one reconciliation cycle
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self) -> Result<CycleReport, SyncError>;
}

/// Reconciler for the nginx upstream file
///
/// Holds the cluster handle and the immutable config; every cycle reads
/// both explicitly instead of going through process-wide state.
pub struct Reconciler<C> {
    cluster: C,
    config: Arc<SyncConfig>,
    reload: ReloadCommand,
}

impl<C: ClusterApi> Reconciler<C> {
    pub fn new(cluster: C, config: Arc<SyncConfig>) -> Self {
        let reload = ReloadCommand::new(config.reload_cmd.clone(), config.reload_timeout);
        Self {
            cluster,
            config,
            reload,
        }
    }

    async fn run_cycle(&self) -> Result<CycleReport, SyncError> {
        let config = &self.config;

        let port = resolve_port(
            &self.cluster,
            &config.namespace,
            &config.service_name,
            config.port_name.as_deref(),
        )
        .await?;
        info!(
            "Using port {} for service {}/{}",
            port, config.namespace, config.service_name
        );

        let filter = config.label_filter();
        let nodes = list_node_addresses(&self.cluster, &filter, config.ignore_not_ready).await?;

        let upstreams =
            UpstreamSet::new(nodes, port).map_err(|_| SyncError::EmptyUpstreamSet {
                namespace: config.namespace.clone(),
                service: config.service_name.clone(),
                selector: filter.selector(),
                ignore_not_ready: config.ignore_not_ready,
            })?;
        let addresses = upstreams.addresses();
        info!("Found nodes: {:?}", addresses);

        write_upstream_conf(&config.upstream_conf, &config.upstream_name, &upstreams).await?;
        info!("Upstream config updated at {}", config.upstream_conf.display());

        let output = self.reload.run().await?;
        if !output.is_empty() {
            debug!("Reload output: {}", output);
        }
        info!("Proxy reloaded successfully ({:?})", self.reload.argv());

        Ok(CycleReport {
            port,
            upstreams: addresses,
            path: config.upstream_conf.clone(),
        })
    }
}

#[async_trait]
impl<C: ClusterApi> Reconcile for Reconciler<C> {
    async fn reconcile(&self) -> Result<CycleReport, SyncError> {
        let start = Instant::now();
        let result = self.run_cycle().await;
        let elapsed = start.elapsed().as_secs_f64();

        match &result {
            Ok(report) => {
                record_reconciliation(elapsed, "success");
                set_upstream_members(report.upstreams.len());
            }
            Err(e) => record_reconciliation(elapsed, e.kind()),
        }

        result
    }
}
