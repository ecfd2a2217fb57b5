//! High-availability metadata and node-crash events
//!
//! The HA manager holds the per-node metadata this node publishes to
//! the cluster (the bus stores its advertised address under
//! [`SERVER_ID_HA_KEY`](crate::bus::SERVER_ID_HA_KEY)) and fans out
//! node-crashed notifications. The membership layer drives
//! [`report_node_crashed`](HaManager::report_node_crashed) with the
//! failed node's HA info; the clustered bus subscribes and scrubs the
//! subscription registry.

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

/// Per-node HA metadata store plus crash-event fan-out
pub struct HaManager {
    node_info: RwLock<Map<String, Value>>,
    crash_tx: broadcast::Sender<Value>,
}

impl HaManager {
    /// Create a manager with empty node info.
    pub fn new() -> Self {
        let (crash_tx, _) = broadcast::channel(16);
        Self {
            node_info: RwLock::new(Map::new()),
            crash_tx,
        }
    }

    /// Publish a metadata entry for this node.
    pub fn put_node_info(&self, key: &str, value: Value) {
        self.node_info.write().insert(key.to_string(), value);
    }

    /// This node's current metadata.
    pub fn node_info(&self) -> Map<String, Value> {
        self.node_info.read().clone()
    }

    /// Subscribe to node-crashed events; each event carries the failed
    /// node's HA info object.
    pub fn subscribe_crashes(&self) -> broadcast::Receiver<Value> {
        self.crash_tx.subscribe()
    }

    /// Report that a node crashed, handing subscribers its HA info.
    ///
    /// Called by the membership layer (or by tests standing in for it).
    pub fn report_node_crashed(&self, ha_info: Value) {
        // No subscribers is fine: nothing to clean up yet.
        let _ = self.crash_tx.send(ha_info);
    }
}

impl Default for HaManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_info_is_stored() {
        let ha = HaManager::new();
        ha.put_node_info("server_id", json!({"host": "a", "port": 1}));
        let info = ha.node_info();
        assert_eq!(info["server_id"]["host"], "a");
        assert_eq!(info["server_id"]["port"], 1);
    }

    #[tokio::test]
    async fn crash_events_reach_subscribers() {
        let ha = HaManager::new();
        let mut rx = ha.subscribe_crashes();
        ha.report_node_crashed(json!({"server_id": {"host": "b", "port": 2}}));

        let info = rx.recv().await.unwrap();
        assert_eq!(info["server_id"]["port"], 2);
    }

    #[test]
    fn report_without_subscribers_is_a_noop() {
        let ha = HaManager::new();
        ha.report_node_crashed(json!({}));
    }
}
