use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by a reconciliation cycle or the node watch
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("node watch subscription failed: {0}")]
    Subscription(#[source] kube::Error),

    #[error("failed to get service {namespace}/{service}: {source}")]
    ServiceLookup {
        namespace: String,
        service: String,
        #[source]
        source: kube::Error,
    },

    #[error("port {port_name:?} not found in service {namespace}/{service}")]
    PortNotFound {
        namespace: String,
        service: String,
        /// Requested port name; empty when any port was acceptable
        port_name: String,
    },

    #[error("failed to list nodes (selector: {}): {source}", .selector.as_deref().unwrap_or("<all>"))]
    NodeList {
        selector: Option<String>,
        #[source]
        source: kube::Error,
    },

    #[error(
        "no nodes found for service {namespace}/{service} (selector: {}, ignore not ready: {ignore_not_ready})",
        .selector.as_deref().unwrap_or("<all>")
    )]
    EmptyUpstreamSet {
        namespace: String,
        service: String,
        selector: Option<String>,
        ignore_not_ready: bool,
    },

    #[error("failed to write upstream config {}: {source}", .path.display())]
    ArtifactWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("reload command not specified")]
    ReloadCommandMissing,

    #[error("reload command {command:?} failed: {reason}, output: {output}")]
    ReloadFailed {
        command: Vec<String>,
        reason: String,
        output: String,
    },
}

impl SyncError {
    /// Short label used for the `result` metric dimension
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Subscription(_) => "subscription_error",
            SyncError::ServiceLookup { .. } => "service_lookup_error",
            SyncError::PortNotFound { .. } => "port_not_found",
            SyncError::NodeList { .. } => "node_list_error",
            SyncError::EmptyUpstreamSet { .. } => "empty_upstream_set",
            SyncError::ArtifactWrite { .. } => "artifact_write_error",
            SyncError::ReloadCommandMissing => "reload_command_missing",
            SyncError::ReloadFailed { .. } => "reload_failed",
        }
    }
}
