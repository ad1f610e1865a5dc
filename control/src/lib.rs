//! Upstream sync controller library
//!
//! Keeps an nginx `upstream` block listing the cluster's nodes in step with
//! Kubernetes node membership. Exposes the reconciler, watcher and config
//! layers for the binary and for tests.

pub mod apis;
pub mod config;
pub mod error;
pub mod reconciler;
pub mod reload;
pub mod upstream_conf;

pub use apis::cluster_state::{ClusterApi, KubeClusterApi, LabelFilter};
pub use apis::node_watcher::{KubeNodeEvents, NodeEvent, NodeEventKind, NodeEventSource, NodeWatcher};
pub use config::{Cli, SyncConfig};
pub use error::SyncError;
pub use reconciler::{CycleReport, Reconcile, Reconciler};
