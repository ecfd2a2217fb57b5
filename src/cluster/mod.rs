//! Cluster collaborators: node identity, the replicated subscription
//! multi-map and the HA metadata/crash-event manager.

pub mod ha;
pub mod multimap;
pub mod node;

pub use ha::HaManager;
pub use multimap::{
    AsyncMultiMap, ChoosableSet, ClusterManager, LocalClusterManager, SharedMultiMap,
};
pub use node::NodeAddress;
