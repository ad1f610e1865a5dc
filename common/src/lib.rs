//! upstream-sync common types
//!
//! Core data structures shared by the controller: node addresses, the resolved
//! service port, and the upstream set rendered into an nginx `upstream` block.
//! Everything here is pure (no I/O, no Kubernetes types) so the rendering rules
//! can be tested in isolation.

use std::fmt;

/// Default nginx upstream block name
pub const DEFAULT_UPSTREAM_NAME: &str = "backend";

/// Indentation used for `server` lines inside the upstream block
const SERVER_INDENT: &str = "    ";

/// Returned when an upstream set would contain no members.
///
/// nginx rejects an `upstream` block without servers, so an empty set is never
/// a valid desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("upstream set must contain at least one node")]
pub struct EmptyUpstreamSet;

/// A node's internal address plus its readiness at the time it was read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    /// Node object name (used for logging only)
    pub name: String,

    /// InternalIP address as reported in node status
    pub ip: String,

    /// True when the node's Ready condition is "True"
    pub ready: bool,
}

impl NodeAddress {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, ready: bool) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            ready,
        }
    }

    /// True if the address is IPv6 (needs brackets in `host:port` form)
    pub fn is_ipv6(&self) -> bool {
        self.ip.contains(':')
    }
}

/// Port the proxy should forward to on every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolvedPort(pub u16);

impl ResolvedPort {
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for ResolvedPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One `server` entry: node address + port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Upstream {
    pub node: NodeAddress,
    pub port: ResolvedPort,
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.node.is_ipv6() {
            write!(f, "[{}]:{}", self.node.ip, self.port)
        } else {
            write!(f, "{}:{}", self.node.ip, self.port)
        }
    }
}

/// The desired upstream membership for one reconciliation cycle.
///
/// Invariant: never empty. The only constructor rejects an empty node list,
/// so anything holding an `UpstreamSet` can render it without re-checking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSet {
    port: ResolvedPort,
    members: Vec<Upstream>,
}

impl UpstreamSet {
    /// Build the set from nodes in listing order.
    ///
    /// Order is preserved as-is: nginx treats member order as insignificant,
    /// and keeping the API order makes output reproducible for identical input.
    pub fn new(nodes: Vec<NodeAddress>, port: ResolvedPort) -> Result<Self, EmptyUpstreamSet> {
        if nodes.is_empty() {
            return Err(EmptyUpstreamSet);
        }

        let members = nodes
            .into_iter()
            .map(|node| Upstream { node, port })
            .collect();

        Ok(Self { port, members })
    }

    pub fn port(&self) -> ResolvedPort {
        self.port
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always false; kept for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Upstream> {
        self.members.iter()
    }

    /// `ip:port` strings in member order (for logging)
    pub fn addresses(&self) -> Vec<String> {
        self.members.iter().map(ToString::to_string).collect()
    }

    /// Render the nginx `upstream` block.
    ///
    /// ```text
    /// upstream backend {
    ///     server 10.0.0.1:8080;
    /// }
    /// ```
    pub fn render(&self, upstream_name: &str) -> String {
        let mut out = String::with_capacity(32 + self.members.len() * 32);
        out.push_str("upstream ");
        out.push_str(upstream_name);
        out.push_str(" {\n");
        for member in &self.members {
            out.push_str(SERVER_INDENT);
            out.push_str("server ");
            out.push_str(&member.to_string());
            out.push_str(";\n");
        }
        out.push_str("}\n");
        out
    }
}

impl<'a> IntoIterator for &'a UpstreamSet {
    type Item = &'a Upstream;
    type IntoIter = std::slice::Iter<'a, Upstream>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.iter()
    }
}
