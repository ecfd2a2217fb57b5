//! Node identity
//!
//! A node is identified by the (host, port) pair of its inbound cluster
//! listener. Identity is structural: two nodes advertising the same
//! coordinates are the same node.

use serde::{Deserialize, Serialize};

/// Network coordinates of a peer's inbound cluster listener
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    /// Hostname or IP address
    pub host: String,
    /// Listener port
    pub port: u16,
}

impl NodeAddress {
    /// Create a new node address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
