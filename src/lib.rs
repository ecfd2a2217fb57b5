//! Clustered event bus
//!
//! A publish/subscribe bus whose handlers can live on any node of a
//! cluster. Each node runs one inbound TCP listener and keeps at most
//! one outbound connection per peer, reused across addresses. A
//! replicated subscription registry maps each address to the set of
//! nodes holding handlers for it; the router consults it to decide
//! between local delivery, a fair point-to-point pick, or a publish
//! fan-out. Replies travel straight back to the requesting node.
//!
//! Delivery is best-effort: a crashed peer's in-flight messages are
//! lost, and its registry entries are scrubbed when the membership
//! layer reports the crash.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use eventbus_rs::{
//!     Body, ClusteredEventBus, EventBus, EventBusOptions, HaManager,
//!     LocalClusterManager,
//! };
//!
//! # async fn example() -> eventbus_rs::Result<()> {
//! let cluster = LocalClusterManager::new();
//! let bus = ClusteredEventBus::new(
//!     EventBusOptions::default().cluster_host("0.0.0.0"),
//!     Arc::new(cluster),
//!     Arc::new(HaManager::new()),
//! )?;
//! bus.start().await?;
//!
//! let mut orders = bus.consumer("orders").await?;
//! tokio::spawn(async move {
//!     while let Some(msg) = orders.recv().await {
//!         println!("order from {}: {:?}", msg.sender, msg.body);
//!     }
//! });
//!
//! bus.publish("orders", Body::Text("order #1".into())).await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub(crate) mod client;
pub mod cluster;
pub mod error;
pub mod protocol;
pub mod server;
pub mod stats;

pub use bus::{
    ClusteredEventBus, DeliveryOptions, EventBus, LocalBus, MessageConsumer, NodeState,
    SERVER_ID_HA_KEY, SUBS_MAP_NAME,
};
pub use cluster::{
    AsyncMultiMap, ChoosableSet, ClusterManager, HaManager, LocalClusterManager, NodeAddress,
    SharedMultiMap,
};
pub use error::{Error, Result};
pub use protocol::{Body, ClusteredMessage, CodecRegistry, Headers, MessageCodec};
pub use server::{EventBusOptions, CLUSTER_PUBLIC_HOST_PROP, CLUSTER_PUBLIC_PORT_PROP};
pub use stats::{BusMetrics, CountingMetrics, MetricsSink, NoopMetrics};
