use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::AuthMode;

/// Numeric node identifier, unique within a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Closed set of node roles in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Discovery service the other nodes use to find each other
    Broker,
    /// Owns persisted data shards for tenants
    Storage,
    /// Durably persists write-ahead-log segments
    Wal,
    /// Maps tenants to storage nodes and brokers reattachment
    Coordinator,
    /// SQL compute endpoint attached to a timeline
    Compute,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Broker => "broker",
            NodeRole::Storage => "storage",
            NodeRole::Wal => "wal",
            NodeRole::Coordinator => "coordinator",
            NodeRole::Compute => "compute",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listener ports assigned to one node.
///
/// Every node exposes an HTTP API; the data-plane listener exists only for
/// roles that speak a wire protocol of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePorts {
    pub data: Option<u16>,
    pub http: u16,
}

impl NodePorts {
    pub fn http_only(http: u16) -> Self {
        Self { data: None, http }
    }

    pub fn with_data(data: u16, http: u16) -> Self {
        Self {
            data: Some(data),
            http,
        }
    }
}

/// Typed record for one node: identity, wiring and on-disk root.
///
/// Created at builder time and immutable thereafter; liveness is tracked by
/// the owning node handle, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub role: NodeRole,
    pub ports: NodePorts,
    pub root_dir: PathBuf,
    pub auth: AuthMode,
}

impl NodeDescriptor {
    pub fn http_base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.ports.http)
    }

    /// host:port string for the node's data-plane listener.
    pub fn data_addr(&self) -> Option<String> {
        self.ports.data.map(|port| format!("localhost:{port}"))
    }
}
