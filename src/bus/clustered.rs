//! Clustered overlay of the event bus
//!
//! Federates a [`LocalBus`] across a dynamic set of peer nodes. Three
//! concerns live here:
//!
//! - the **subscription registry client**: addresses with at least one
//!   advertisable local handler are published to the replicated
//!   multi-map `__vertx.subs`, withdrawn when the last such handler
//!   leaves, and scrubbed wholesale when a node crashes;
//! - the **routing policy**: point-to-point sends pick one subscriber
//!   node fairly, publishes fan out to all of them, replies go straight
//!   back to the original sender without a registry lookup, and nothing
//!   is ever sent to self over the wire;
//! - the **node lifecycle**: startup binds the peer listener, resolves
//!   and announces the public node address, installs the crash watcher,
//!   and only then accepts traffic; shutdown stops the local bus, the
//!   listener and every peer connection in that order.
//!
//! All user-submitted sends funnel through a single ordering task, so
//! messages submitted back-to-back from anywhere keep their order per
//! (source, peer) even though the registry lookup is asynchronous.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::consumer::{ConsumerBus, MessageConsumer};
use crate::bus::local::LocalBus;
use crate::bus::{DeliveryOptions, EventBus};
use crate::client::holder::{ConnectionHolder, Connections};
use crate::cluster::ha::HaManager;
use crate::cluster::multimap::{AsyncMultiMap, ChoosableSet, ClusterManager};
use crate::cluster::node::NodeAddress;
use crate::error::{Error, Result};
use crate::protocol::codec::{Body, CodecRegistry};
use crate::protocol::frame::encode_record;
use crate::protocol::message::ClusteredMessage;
use crate::server::config::EventBusOptions;
use crate::server::listener::PeerServer;
use crate::stats::{BusMetrics, MetricsSink};

/// Name of the replicated subscription map.
pub const SUBS_MAP_NAME: &str = "__vertx.subs";

/// HA metadata key under which a node announces its address.
pub const SERVER_ID_HA_KEY: &str = "server_id";

/// Lifecycle state of a clustered bus node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Constructed, not yet started
    Init,
    /// Startup in progress
    Starting,
    /// Serving traffic
    Running,
    /// Shutdown in progress
    Stopping,
    /// Shut down (terminal)
    Stopped,
}

const STATE_INIT: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_STOPPING: u8 = 3;
const STATE_STOPPED: u8 = 4;

enum RouterJob {
    /// A user-submitted send or publish: look up subscribers and route
    Route(ClusteredMessage),
    /// A reply: goes straight to `dest`, no registry lookup
    Reply {
        msg: ClusteredMessage,
        dest: NodeAddress,
    },
}

/// Shared state of one clustered bus node
pub(crate) struct ClusterCore {
    options: EventBusOptions,
    local: Arc<LocalBus>,
    codecs: Arc<CodecRegistry>,
    cluster: Arc<dyn ClusterManager>,
    ha: Arc<HaManager>,
    metrics: Arc<dyn BusMetrics>,
    state: AtomicU8,
    connections: Connections,
    subs: OnceLock<Arc<dyn AsyncMultiMap>>,
    node_id: OnceLock<NodeAddress>,
    server: Mutex<Option<PeerServer>>,
    router_tx: OnceLock<mpsc::UnboundedSender<RouterJob>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterCore {
    pub(crate) fn local(&self) -> &Arc<LocalBus> {
        &self.local
    }

    fn state(&self) -> NodeState {
        match self.state.load(Ordering::Acquire) {
            STATE_INIT => NodeState::Init,
            STATE_STARTING => NodeState::Starting,
            STATE_RUNNING => NodeState::Running,
            STATE_STOPPING => NodeState::Stopping,
            _ => NodeState::Stopped,
        }
    }

    fn transition(&self, from: u8, to: u8) -> Result<()> {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::NotRunning)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.state() == NodeState::Running {
            Ok(())
        } else {
            Err(Error::NotRunning)
        }
    }

    fn node_id(&self) -> Result<&NodeAddress> {
        self.node_id.get().ok_or(Error::NotRunning)
    }

    fn subs(&self) -> Result<&Arc<dyn AsyncMultiMap>> {
        self.subs.get().ok_or(Error::NotRunning)
    }

    fn enqueue(&self, job: RouterJob) -> Result<()> {
        let tx = self.router_tx.get().ok_or(Error::NotRunning)?;
        tx.send(job).map_err(|_| Error::NotRunning)
    }

    fn make_message(
        &self,
        address: &str,
        body: Body,
        options: DeliveryOptions,
        is_send: bool,
    ) -> Result<ClusteredMessage> {
        let mut msg = ClusteredMessage::new(self.node_id()?.clone(), address, body, is_send);
        msg.headers = options.headers;
        msg.codec_name = options.codec_name;
        Ok(msg)
    }

    /// Remove a handler; withdraw the cluster registration when it was
    /// the last advertisable handler at the address.
    pub(crate) async fn unregister(&self, address: &str, id: u64) -> Result<()> {
        let removal = self.local.remove_handler(address, id);
        if !removal.last_cluster_handler {
            return Ok(());
        }
        let node = self.node_id()?.clone();
        match self.subs()?.remove(address, &node).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::SubNotFound {
                address: address.to_string(),
                node,
            }),
            Err(e) => {
                // Transport-level registry failures stay internal; only
                // the asymmetry signal surfaces.
                error!(address = %address, error = %e, "failed to remove subscription");
                Ok(())
            }
        }
    }
}

/// Event bus clustered over a TCP peer fabric
///
/// Cheap to clone; clones share one node.
#[derive(Clone)]
pub struct ClusteredEventBus {
    core: Arc<ClusterCore>,
}

impl ClusteredEventBus {
    /// Create a clustered bus with the default metrics sink.
    ///
    /// Validates `options`; the bus must then be [`start`](Self::start)ed.
    pub fn new(
        options: EventBusOptions,
        cluster: Arc<dyn ClusterManager>,
        ha: Arc<HaManager>,
    ) -> Result<Self> {
        Self::with_metrics(options, cluster, ha, Arc::new(MetricsSink))
    }

    /// Create a clustered bus with a custom metrics sink.
    pub fn with_metrics(
        options: EventBusOptions,
        cluster: Arc<dyn ClusterManager>,
        ha: Arc<HaManager>,
        metrics: Arc<dyn BusMetrics>,
    ) -> Result<Self> {
        options.validate()?;
        let local = Arc::new(LocalBus::with_reply_timeout(options.reply_timeout));
        Ok(Self {
            core: Arc::new(ClusterCore {
                options,
                local,
                codecs: Arc::new(CodecRegistry::new()),
                cluster,
                ha,
                metrics,
                state: AtomicU8::new(STATE_INIT),
                connections: Arc::new(DashMap::new()),
                subs: OnceLock::new(),
                node_id: OnceLock::new(),
                server: Mutex::new(None),
                router_tx: OnceLock::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// The codec table used for wire bodies.
    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.core.codecs
    }

    /// The HA manager this node announces itself through.
    pub fn ha(&self) -> &Arc<HaManager> {
        &self.core.ha
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        self.core.state()
    }

    /// The advertised node address, once started.
    pub fn node_id(&self) -> Option<NodeAddress> {
        self.core.node_id.get().cloned()
    }

    /// Number of live outbound peer connections.
    pub fn connection_count(&self) -> usize {
        self.core.connections.len()
    }

    /// Start the node: acquire the subscription map, bind the peer
    /// listener, announce the public address and begin routing.
    ///
    /// Fails with [`Error::Startup`] carrying the underlying cause; a
    /// failed node does not restart.
    pub async fn start(&self) -> Result<()> {
        self.core.transition(STATE_INIT, STATE_STARTING)?;
        match self.do_start().await {
            Ok(()) => {
                self.core.transition(STATE_STARTING, STATE_RUNNING)?;
                Ok(())
            }
            Err(e) => {
                self.core.state.store(STATE_STOPPED, Ordering::Release);
                Err(Error::startup(e))
            }
        }
    }

    async fn do_start(&self) -> Result<()> {
        let core = &self.core;

        let subs = core.cluster.get_multi_map(SUBS_MAP_NAME).await?;
        let _ = core.subs.set(Arc::clone(&subs));

        let server = PeerServer::bind(
            &core.options.cluster_host,
            core.options.cluster_port,
            core.options.max_record_size,
            Arc::clone(&core.local),
            Arc::clone(&core.codecs),
            Arc::clone(&core.metrics),
        )
        .await?;
        let actual_port = server.local_addr().port();
        *core.server.lock() = Some(server);

        let node_id = NodeAddress::new(
            core.options.resolve_public_host(),
            core.options.resolve_public_port(actual_port),
        );
        let _ = core.node_id.set(node_id.clone());

        core.ha.put_node_info(
            SERVER_ID_HA_KEY,
            serde_json::json!({"host": node_id.host, "port": node_id.port}),
        );

        let watcher = spawn_crash_watcher(Arc::clone(&subs), core.ha.subscribe_crashes());

        let (router_tx, router_rx) = mpsc::unbounded_channel();
        let _ = core.router_tx.set(router_tx);
        let ping = ClusteredMessage::ping(node_id.clone());
        let ctx = RouterCtx {
            node_id: node_id.clone(),
            options: core.options.clone(),
            local: Arc::clone(&core.local),
            codecs: Arc::clone(&core.codecs),
            metrics: Arc::clone(&core.metrics),
            subs,
            connections: Arc::clone(&core.connections),
            ping_record: encode_record(&ping.encode(&core.codecs)?),
        };
        let router = tokio::spawn(router_loop(ctx, router_rx));

        let mut tasks = core.tasks.lock();
        tasks.push(watcher);
        tasks.push(router);

        info!(node = %node_id, "clustered event bus started");
        Ok(())
    }

    /// Shut the node down: local bus first, then the peer listener,
    /// then every outbound connection.
    ///
    /// The first error is surfaced; the remaining teardown still runs.
    pub async fn close(&self) -> Result<()> {
        let core = &self.core;
        core.transition(STATE_RUNNING, STATE_STOPPING)?;

        let mut first_error: Option<Error> = None;

        core.local.close();

        let server = core.server.lock().take();
        if let Some(server) = server {
            if let Err(e) = server.close().await {
                error!(error = %e, "failed to close cluster listener");
                first_error.get_or_insert(e);
            }
        }

        let holders: Vec<_> = core
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for holder in holders {
            holder.close();
        }

        for task in core.tasks.lock().drain(..) {
            task.abort();
        }

        core.state.store(STATE_STOPPED, Ordering::Release);
        info!("clustered event bus stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl EventBus for ClusteredEventBus {
    async fn send_with(&self, address: &str, body: Body, options: DeliveryOptions) -> Result<()> {
        self.core.ensure_running()?;
        let msg = self.core.make_message(address, body, options, true)?;
        self.core.enqueue(RouterJob::Route(msg))
    }

    async fn publish_with(
        &self,
        address: &str,
        body: Body,
        options: DeliveryOptions,
    ) -> Result<()> {
        self.core.ensure_running()?;
        let msg = self.core.make_message(address, body, options, false)?;
        self.core.enqueue(RouterJob::Route(msg))
    }

    async fn request_with(
        &self,
        address: &str,
        body: Body,
        options: DeliveryOptions,
    ) -> Result<ClusteredMessage> {
        self.core.ensure_running()?;

        // The reply address is a fresh unguessable token; the one-shot
        // handler at it is never advertised to the cluster.
        let reply_address = Uuid::new_v4().to_string();
        let (registration, mut rx) = self.core.local.add_handler(&reply_address, false, true);

        let mut msg = self.core.make_message(address, body, options, true)?;
        msg.reply_address = Some(reply_address.clone());
        if let Err(e) = self.core.enqueue(RouterJob::Route(msg)) {
            self.core.local.remove_handler(&reply_address, registration.id);
            return Err(e);
        }

        let timeout = self.core.options.reply_timeout;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(Error::NotRunning),
            Err(_) => {
                self.core.local.remove_handler(&reply_address, registration.id);
                Err(Error::ReplyTimeout(timeout))
            }
        }
    }

    async fn reply_with(
        &self,
        to: &ClusteredMessage,
        body: Body,
        options: DeliveryOptions,
    ) -> Result<()> {
        self.core.ensure_running()?;
        let reply_address = to.reply_address.clone().ok_or(Error::NoReplyAddress)?;
        let msg = self
            .core
            .make_message(&reply_address, body, options, true)?;
        self.core.enqueue(RouterJob::Reply {
            msg,
            dest: to.sender.clone(),
        })
    }

    async fn consumer(&self, address: &str) -> Result<MessageConsumer> {
        self.core.ensure_running()?;
        let (registration, rx) = self.core.local.add_handler(address, false, false);
        if registration.first_cluster_handler {
            let node = self.core.node_id()?.clone();
            if let Err(e) = self.core.subs()?.add(address, node).await {
                // Roll back so the consumer either exists cluster-wide
                // or not at all.
                self.core.local.remove_handler(address, registration.id);
                return Err(e);
            }
        }
        Ok(MessageConsumer::new(
            address.to_string(),
            registration.id,
            rx,
            ConsumerBus::Clustered(Arc::clone(&self.core)),
        ))
    }

    async fn local_consumer(&self, address: &str) -> Result<MessageConsumer> {
        self.core.ensure_running()?;
        let (registration, rx) = self.core.local.add_handler(address, true, false);
        Ok(MessageConsumer::new(
            address.to_string(),
            registration.id,
            rx,
            ConsumerBus::Clustered(Arc::clone(&self.core)),
        ))
    }
}

fn spawn_crash_watcher(
    subs: Arc<dyn AsyncMultiMap>,
    mut crashes: tokio::sync::broadcast::Receiver<serde_json::Value>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let ha_info = match crashes.recv().await {
                Ok(info) => info,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "crash watcher lagged behind HA events");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            let Some(failed) = node_from_ha_info(&ha_info) else {
                debug!("node-crashed event without a usable server id");
                continue;
            };
            info!(node = %failed, "scrubbing subscriptions of crashed node");
            if let Err(e) = subs.remove_all_for_value(&failed).await {
                error!(node = %failed, error = %e, "crash cleanup failed");
            }
        }
    })
}

fn node_from_ha_info(ha_info: &serde_json::Value) -> Option<NodeAddress> {
    let sid = ha_info.get(SERVER_ID_HA_KEY)?;
    let host = sid.get("host")?.as_str()?;
    let port = u16::try_from(sid.get("port")?.as_u64()?).ok()?;
    Some(NodeAddress::new(host, port))
}

struct RouterCtx {
    node_id: NodeAddress,
    options: EventBusOptions,
    local: Arc<LocalBus>,
    codecs: Arc<CodecRegistry>,
    metrics: Arc<dyn BusMetrics>,
    subs: Arc<dyn AsyncMultiMap>,
    connections: Connections,
    ping_record: Bytes,
}

/// The ordering fence: one task drains the job queue sequentially, so
/// the async subscriber lookups of back-to-back sends cannot reorder
/// them.
async fn router_loop(ctx: RouterCtx, mut rx: mpsc::UnboundedReceiver<RouterJob>) {
    while let Some(job) = rx.recv().await {
        match job {
            RouterJob::Route(msg) => route(&ctx, msg).await,
            RouterJob::Reply { msg, dest } => send_reply(&ctx, msg, &dest),
        }
    }
}

async fn route(ctx: &RouterCtx, msg: ClusteredMessage) {
    let address = msg.address.clone();
    match ctx.subs.get(&address).await {
        Err(e) => {
            error!(address = %address, error = %e, "subscriber lookup failed; dropping message");
        }
        Ok(subs) if subs.is_empty() => {
            // No remote subscribers anywhere; the local bus discards it
            // if nobody local listens either.
            ctx.metrics
                .message_sent(&address, !msg.is_send, true, false);
            ctx.local.deliver(&msg);
        }
        Ok(subs) => send_to_subs(ctx, &subs, msg),
    }
}

fn send_to_subs(ctx: &RouterCtx, subs: &ChoosableSet, msg: ClusteredMessage) {
    let address = msg.address.clone();
    if msg.is_send {
        // The set is non-empty here, so choose always yields a node.
        let Some(target) = subs.choose().cloned() else {
            return;
        };
        if target == ctx.node_id {
            ctx.metrics.message_sent(&address, false, true, false);
            ctx.local.deliver(&msg);
        } else {
            ctx.metrics.message_sent(&address, false, false, true);
            if let Some(framed) = encode_framed(ctx, &msg) {
                send_remote(ctx, &target, framed);
            }
        }
    } else {
        let local = subs.contains(&ctx.node_id);
        let remote_targets: Vec<NodeAddress> = subs
            .iter()
            .filter(|t| **t != ctx.node_id)
            .cloned()
            .collect();
        if !remote_targets.is_empty() {
            if let Some(framed) = encode_framed(ctx, &msg) {
                for target in &remote_targets {
                    send_remote(ctx, target, framed.clone());
                }
            }
        }
        ctx.metrics
            .message_sent(&address, true, local, !remote_targets.is_empty());
        if local {
            ctx.local.deliver(&msg);
        }
    }
}

fn send_reply(ctx: &RouterCtx, msg: ClusteredMessage, dest: &NodeAddress) {
    // Replies never consult the registry: reply addresses are one-shot
    // local tokens known only to the two parties.
    if *dest == ctx.node_id {
        ctx.metrics.message_sent(&msg.address, false, true, false);
        ctx.local.deliver(&msg);
    } else {
        ctx.metrics.message_sent(&msg.address, false, false, true);
        if let Some(framed) = encode_framed(ctx, &msg) {
            send_remote(ctx, dest, framed);
        }
    }
}

fn encode_framed(ctx: &RouterCtx, msg: &ClusteredMessage) -> Option<Bytes> {
    match msg.encode(&ctx.codecs) {
        Ok(payload) => Some(encode_record(&payload)),
        Err(e) => {
            error!(address = %msg.address, error = %e, "failed to encode message; dropping");
            None
        }
    }
}

fn send_remote(ctx: &RouterCtx, peer: &NodeAddress, framed: Bytes) {
    // Two attempts: losing a race against a holder that closed between
    // lookup and write just means creating its replacement ourselves.
    for _ in 0..2 {
        let holder = match ctx.connections.entry(peer.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Arc::clone(entry.get()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let holder = ConnectionHolder::spawn(
                    peer.clone(),
                    &ctx.options,
                    ctx.ping_record.clone(),
                    Arc::clone(&ctx.connections),
                );
                slot.insert(Arc::clone(&holder));
                holder
            }
        };
        if holder.write(framed.clone()).is_ok() {
            return;
        }
        ctx.connections
            .remove_if(peer, |_, existing| Arc::ptr_eq(existing, &holder));
    }
    debug!(peer = %peer, "dropping message for closed peer connection");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::multimap::LocalClusterManager;
    use std::time::Duration;

    fn bus(cluster: &LocalClusterManager) -> ClusteredEventBus {
        ClusteredEventBus::new(
            EventBusOptions::default().connect_timeout(Duration::from_millis(500)),
            Arc::new(cluster.clone()),
            Arc::new(HaManager::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn operations_require_running_state() {
        let cluster = LocalClusterManager::new();
        let bus = bus(&cluster);
        assert_eq!(bus.state(), NodeState::Init);

        assert!(matches!(
            bus.send("svc", Body::Ping).await,
            Err(Error::NotRunning)
        ));
        assert!(matches!(
            bus.consumer("svc").await,
            Err(Error::NotRunning)
        ));
    }

    #[tokio::test]
    async fn start_announces_server_id_and_runs() {
        let cluster = LocalClusterManager::new();
        let bus = bus(&cluster);
        bus.start().await.unwrap();
        assert_eq!(bus.state(), NodeState::Running);

        let node = bus.node_id().unwrap();
        assert_ne!(node.port, 0);
        let info = bus.ha().node_info();
        assert_eq!(info[SERVER_ID_HA_KEY]["host"], node.host.as_str());
        assert_eq!(info[SERVER_ID_HA_KEY]["port"], node.port);

        bus.close().await.unwrap();
        assert_eq!(bus.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let cluster = LocalClusterManager::new();
        let bus = bus(&cluster);
        bus.start().await.unwrap();
        assert!(bus.start().await.is_err());
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn consumer_advertises_once_per_address() {
        let cluster = LocalClusterManager::new();
        let bus = bus(&cluster);
        bus.start().await.unwrap();
        let node = bus.node_id().unwrap();

        let first = bus.consumer("svc").await.unwrap();
        let second = bus.consumer("svc").await.unwrap();
        let subs = cluster.multi_map(SUBS_MAP_NAME);
        let set = subs.get("svc").await.unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains(&node));

        // Unregistering the non-last handler keeps the advertisement.
        first.unregister().await.unwrap();
        assert!(!subs.get("svc").await.unwrap().is_empty());

        second.unregister().await.unwrap();
        assert!(subs.get("svc").await.unwrap().is_empty());

        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn local_consumer_never_advertises() {
        let cluster = LocalClusterManager::new();
        let bus = bus(&cluster);
        bus.start().await.unwrap();

        let consumer = bus.local_consumer("svc").await.unwrap();
        let subs = cluster.multi_map(SUBS_MAP_NAME);
        assert!(subs.get("svc").await.unwrap().is_empty());

        consumer.unregister().await.unwrap();
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn unregister_twice_surfaces_sub_not_found() {
        let cluster = LocalClusterManager::new();
        let bus = bus(&cluster);
        bus.start().await.unwrap();

        let consumer = bus.consumer("svc").await.unwrap();
        // Remove the registry entry behind the consumer's back.
        let subs = cluster.multi_map(SUBS_MAP_NAME);
        let node = bus.node_id().unwrap();
        assert!(subs.remove("svc", &node).await.unwrap());

        let err = consumer.unregister().await.unwrap_err();
        assert!(matches!(err, Error::SubNotFound { .. }));

        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn crash_event_parses_server_id() {
        let info = serde_json::json!({"server_id": {"host": "b", "port": 1001}});
        assert_eq!(
            node_from_ha_info(&info),
            Some(NodeAddress::new("b", 1001))
        );
        assert_eq!(node_from_ha_info(&serde_json::json!({})), None);
        let bad_port = serde_json::json!({"server_id": {"host": "b", "port": 700000}});
        assert_eq!(node_from_ha_info(&bad_port), None);
    }
}
