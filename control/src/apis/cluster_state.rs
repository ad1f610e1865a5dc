//! Cluster state reader
//!
//! Reads the two pieces of cluster state a reconciliation cycle needs:
//!
//! 1. The target Service's exposed port (node port preferred over the
//!    cluster port), picked by name or, without a name, the first port.
//! 2. The node inventory, narrowed by an optional label filter and an optional
//!    readiness filter, reduced to each node's first `InternalIP`.
//!
//! All reads go through [`ClusterApi`] so the filtering rules can be tested
//! against plain `k8s_openapi` objects without an API server.

use crate::error::SyncError;
use async_trait::async_trait;
use common::{NodeAddress, ResolvedPort};
use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use tracing::debug;

/// Node address type we publish to the proxy
const INTERNAL_IP: &str = "InternalIP";

/// Node condition type used for readiness filtering
const READY_CONDITION: &str = "Ready";

/// Read-only access to the cluster objects used by a cycle
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Get a Service by namespace and name
    async fn service(&self, namespace: &str, name: &str) -> Result<Service, kube::Error>;

    /// List Nodes, optionally narrowed by a label selector
    async fn nodes(&self, selector: Option<&str>) -> Result<Vec<Node>, kube::Error>;
}

/// [`ClusterApi`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn service(&self, namespace: &str, name: &str) -> Result<Service, kube::Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await
    }

    async fn nodes(&self, selector: Option<&str>) -> Result<Vec<Node>, kube::Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let params = match selector {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        };
        Ok(api.list(&params).await?.items)
    }
}

/// Node label filter
///
/// - key + value: `key=value` (exact match)
/// - key only: `key` (label present, any value)
/// - neither: every node
///
/// A value without a key is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter {
    key: Option<String>,
    value: Option<String>,
}

impl LabelFilter {
    pub fn new(key: Option<String>, value: Option<String>) -> Self {
        let key = key.filter(|k| !k.is_empty());
        let value = value.filter(|v| !v.is_empty());
        Self { key, value }
    }

    /// Label selector string for the list call
    pub fn selector(&self) -> Option<String> {
        let key = self.key.as_ref()?;
        Some(match &self.value {
            Some(value) => format!("{}={}", key, value),
            None => key.clone(),
        })
    }

    /// Client-side check of the same rule the selector expresses
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let Some(key) = &self.key else {
            return true;
        };
        match (&self.value, labels.get(key)) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(want), Some(have)) => want == have,
        }
    }
}

/// Pick the port to publish from a Service.
///
/// Ports are scanned in declared order. Without a requested name the first
/// port wins. The node port is preferred when set; otherwise the service port.
pub fn resolve_service_port(service: &Service, port_name: Option<&str>) -> Option<ResolvedPort> {
    let ports = service.spec.as_ref()?.ports.as_ref()?;

    let port = ports.iter().find(|p| match port_name {
        None => true,
        Some(name) => p.name.as_deref() == Some(name),
    })?;

    let node_port = port
        .node_port
        .filter(|n| *n != 0)
        .and_then(|n| u16::try_from(n).ok());

    node_port
        .or_else(|| u16::try_from(port.port).ok().filter(|p| *p != 0))
        .map(ResolvedPort)
}

/// True when the node reports a Ready condition with status "True".
/// A missing condition counts as not ready.
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == READY_CONDITION))
        .map(|condition| condition.status == "True")
        .unwrap_or(false)
}

/// First InternalIP address reported by the node
pub fn internal_ip(node: &Node) -> Option<&str> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|addr| addr.type_ == INTERNAL_IP)
        .map(|addr| addr.address.as_str())
}

/// Reduce listed nodes to the addresses to publish, keeping listing order.
///
/// Nodes outside the label filter, not-ready nodes (when `ignore_not_ready`),
/// and nodes without an InternalIP are skipped.
pub fn node_addresses(
    nodes: &[Node],
    filter: &LabelFilter,
    ignore_not_ready: bool,
) -> Vec<NodeAddress> {
    let no_labels = BTreeMap::new();
    let mut addresses = Vec::with_capacity(nodes.len());

    for node in nodes {
        let name = node.name_any();

        if !filter.matches(node.metadata.labels.as_ref().unwrap_or(&no_labels)) {
            debug!("Node {} does not match label filter, skipping", name);
            continue;
        }

        let ready = is_node_ready(node);
        if ignore_not_ready && !ready {
            debug!("Node {} is not Ready, skipping", name);
            continue;
        }

        match internal_ip(node) {
            Some(ip) => addresses.push(NodeAddress::new(name, ip, ready)),
            None => debug!("Node {} has no InternalIP address, skipping", name),
        }
    }

    addresses
}

/// Resolve the published port for `namespace/service`
pub async fn resolve_port<C: ClusterApi + ?Sized>(
    api: &C,
    namespace: &str,
    service: &str,
    port_name: Option<&str>,
) -> Result<ResolvedPort, SyncError> {
    let svc = api
        .service(namespace, service)
        .await
        .map_err(|source| SyncError::ServiceLookup {
            namespace: namespace.to_string(),
            service: service.to_string(),
            source,
        })?;

    resolve_service_port(&svc, port_name).ok_or_else(|| SyncError::PortNotFound {
        namespace: namespace.to_string(),
        service: service.to_string(),
        port_name: port_name.unwrap_or_default().to_string(),
    })
}

/// List nodes through the API and apply label and readiness filters
pub async fn list_node_addresses<C: ClusterApi + ?Sized>(
    api: &C,
    filter: &LabelFilter,
    ignore_not_ready: bool,
) -> Result<Vec<NodeAddress>, SyncError> {
    let selector = filter.selector();
    let nodes = api
        .nodes(selector.as_deref())
        .await
        .map_err(|source| SyncError::NodeList { selector, source })?;

    Ok(node_addresses(&nodes, filter, ignore_not_ready))
}
