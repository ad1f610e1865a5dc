//! Kubernetes API integrations
//!
//! Cluster state reads, the node membership watcher and controller metrics.

pub mod cluster_state;
pub mod metrics;
pub mod node_watcher;
