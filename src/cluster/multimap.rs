//! Replicated subscription multi-map
//!
//! The cluster membership service supplies a replicated key → set-of-values
//! store keyed by address and valued by [`NodeAddress`]. The bus only
//! depends on the [`AsyncMultiMap`] contract; [`SharedMultiMap`] is the
//! in-memory implementation used by co-process clusters and tests.
//!
//! `get` returns a [`ChoosableSet`]: a snapshot of the subscriber nodes
//! plus a `choose()` operation that rotates through them fairly. The
//! rotation counter lives with the map entry, not the snapshot, so
//! fairness holds across successive lookups of the same address.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::RwLock;

use crate::cluster::node::NodeAddress;
use crate::error::Result;

/// Snapshot of an address's subscriber nodes with fair selection
#[derive(Debug, Clone, Default)]
pub struct ChoosableSet {
    items: Vec<NodeAddress>,
    cursor: Arc<AtomicUsize>,
}

impl ChoosableSet {
    fn new(items: Vec<NodeAddress>, cursor: Arc<AtomicUsize>) -> Self {
        Self { items, cursor }
    }

    /// Whether the snapshot holds no subscribers
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of subscriber nodes
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether `node` is among the subscribers
    pub fn contains(&self, node: &NodeAddress) -> bool {
        self.items.contains(node)
    }

    /// Iterate the subscriber nodes
    pub fn iter(&self) -> impl Iterator<Item = &NodeAddress> {
        self.items.iter()
    }

    /// Pick one subscriber, rotating through the set on successive calls.
    pub fn choose(&self) -> Option<&NodeAddress> {
        if self.items.is_empty() {
            return None;
        }
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(&self.items[n % self.items.len()])
    }
}

/// Contract of the replicated address → nodes map
#[async_trait]
pub trait AsyncMultiMap: Send + Sync {
    /// Add `value` to the set stored under `key`.
    async fn add(&self, key: &str, value: NodeAddress) -> Result<()>;

    /// Remove `value` from the set under `key`.
    ///
    /// Returns whether a matching entry was found.
    async fn remove(&self, key: &str, value: &NodeAddress) -> Result<bool>;

    /// Remove `value` from every key's set.
    async fn remove_all_for_value(&self, value: &NodeAddress) -> Result<()>;

    /// Snapshot the set under `key`.
    async fn get(&self, key: &str) -> Result<ChoosableSet>;
}

struct Entry {
    values: Vec<NodeAddress>,
    cursor: Arc<AtomicUsize>,
}

/// In-memory multi-map shared by every node holding a clone
pub struct SharedMultiMap {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl SharedMultiMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Keys currently present (test/introspection helper).
    pub async fn keys(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }
}

impl Clone for SharedMultiMap {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl Default for SharedMultiMap {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AsyncMultiMap for SharedMultiMap {
    async fn add(&self, key: &str, value: NodeAddress) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            values: Vec::new(),
            cursor: Arc::new(AtomicUsize::new(0)),
        });
        if !entry.values.contains(&value) {
            entry.values.push(value);
        }
        Ok(())
    }

    async fn remove(&self, key: &str, value: &NodeAddress) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(key) else {
            return Ok(false);
        };
        let before = entry.values.len();
        entry.values.retain(|v| v != value);
        let found = entry.values.len() < before;
        if entry.values.is_empty() {
            entries.remove(key);
        }
        Ok(found)
    }

    async fn remove_all_for_value(&self, value: &NodeAddress) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| {
            entry.values.retain(|v| v != value);
            !entry.values.is_empty()
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<ChoosableSet> {
        let entries = self.entries.read().await;
        Ok(match entries.get(key) {
            Some(entry) => ChoosableSet::new(entry.values.clone(), Arc::clone(&entry.cursor)),
            None => ChoosableSet::default(),
        })
    }
}

/// Seam to the cluster membership service
#[async_trait]
pub trait ClusterManager: Send + Sync {
    /// Acquire the replicated multi-map registered under `name`.
    async fn get_multi_map(&self, name: &str) -> Result<Arc<dyn AsyncMultiMap>>;
}

/// Membership service for clusters whose nodes share one process
///
/// Every node handed a clone observes the same maps. This is the
/// backing used by the integration tests and by embedded multi-node
/// setups.
#[derive(Clone, Default)]
pub struct LocalClusterManager {
    maps: Arc<Mutex<HashMap<String, Arc<SharedMultiMap>>>>,
}

impl LocalClusterManager {
    /// Create a membership service with no maps yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct handle to a named map (test/introspection helper).
    pub fn multi_map(&self, name: &str) -> Arc<SharedMultiMap> {
        let mut maps = self.maps.lock();
        Arc::clone(
            maps.entry(name.to_string())
                .or_insert_with(|| Arc::new(SharedMultiMap::new())),
        )
    }
}

#[async_trait]
impl ClusterManager for LocalClusterManager {
    async fn get_multi_map(&self, name: &str) -> Result<Arc<dyn AsyncMultiMap>> {
        Ok(self.multi_map(name) as Arc<dyn AsyncMultiMap>)
    }
}
