//! Public-address resolution
//!
//! Lives in its own test binary: it mutates process-level environment
//! overrides, which are read once during startup and must not race
//! with other starting nodes.

use std::sync::Arc;

use eventbus_rs::{
    ClusteredEventBus, EventBusOptions, HaManager, LocalClusterManager,
    CLUSTER_PUBLIC_HOST_PROP, CLUSTER_PUBLIC_PORT_PROP,
};

#[tokio::test]
async fn env_host_override_with_actual_bound_port() {
    // Wildcard bind, host override set, no port override: advertised
    // address must be the override host plus the actual bound port.
    std::env::set_var(CLUSTER_PUBLIC_HOST_PROP, "ext.example");
    std::env::remove_var(CLUSTER_PUBLIC_PORT_PROP);

    let cluster = LocalClusterManager::new();
    let bus = ClusteredEventBus::new(
        EventBusOptions::default()
            .cluster_host("0.0.0.0")
            .cluster_port(0),
        Arc::new(cluster),
        Arc::new(HaManager::new()),
    )
    .unwrap();
    bus.start().await.unwrap();

    let node = bus.node_id().unwrap();
    assert_eq!(node.host, "ext.example");
    assert_ne!(node.port, 0);

    let info = bus.ha().node_info();
    assert_eq!(info["server_id"]["host"], "ext.example");
    assert_eq!(info["server_id"]["port"], node.port);

    bus.close().await.unwrap();
    std::env::remove_var(CLUSTER_PUBLIC_HOST_PROP);
}
