//! Node-local message dispatch
//!
//! The local bus owns the in-process handler table: which channels are
//! registered at which address, with their local-only and reply flags.
//! Point-to-point sends rotate through a per-address cursor; publishes
//! fan out to every handler. Reply handlers are one-shot and removed on
//! their first delivery. Messages decoded from the wire are never
//! handed to local-only handlers.
//!
//! [`LocalBus`] is a complete bus on its own for single-node use; the
//! clustered overlay composes one and delegates all local work to it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bus::consumer::{ConsumerBus, MessageConsumer};
use crate::bus::{DeliveryOptions, EventBus};
use crate::cluster::node::NodeAddress;
use crate::error::{Error, Result};
use crate::protocol::codec::Body;
use crate::protocol::message::ClusteredMessage;

/// Outcome of adding a handler
#[derive(Debug, Clone, Copy)]
pub(crate) struct Registration {
    /// Handler id, used to remove it later
    pub id: u64,
    /// True when this is the first advertisable (non-reply,
    /// non-local-only) handler at the address
    pub first_cluster_handler: bool,
}

/// Outcome of removing a handler
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Removal {
    /// Whether a handler with the given id existed
    pub found: bool,
    /// True when the removed handler was the last advertisable one at
    /// the address
    pub last_cluster_handler: bool,
}

struct HandlerEntry {
    id: u64,
    tx: mpsc::UnboundedSender<ClusteredMessage>,
    local_only: bool,
    is_reply: bool,
}

impl HandlerEntry {
    fn advertisable(&self) -> bool {
        !self.local_only && !self.is_reply
    }

    fn accepts(&self, msg: &ClusteredMessage) -> bool {
        !msg.from_wire || !self.local_only
    }
}

#[derive(Default)]
struct HandlerSet {
    entries: Vec<HandlerEntry>,
    cursor: usize,
}

/// In-process event bus
pub struct LocalBus {
    handlers: RwLock<HashMap<String, HandlerSet>>,
    next_id: AtomicU64,
    reply_timeout: Duration,
    node: NodeAddress,
}

impl LocalBus {
    /// Create a local bus with the default 30 s reply timeout.
    pub fn new() -> Self {
        Self::with_reply_timeout(Duration::from_secs(30))
    }

    /// Create a local bus with a custom reply timeout.
    pub fn with_reply_timeout(reply_timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            reply_timeout,
            node: NodeAddress::new("local", 0),
        }
    }

    /// Register a handler, returning its registration outcome and the
    /// receiving end of its channel.
    pub(crate) fn add_handler(
        &self,
        address: &str,
        local_only: bool,
        is_reply: bool,
    ) -> (Registration, mpsc::UnboundedReceiver<ClusteredMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self.handlers.write();
        let set = handlers.entry(address.to_string()).or_default();
        let first_cluster_handler =
            !local_only && !is_reply && !set.entries.iter().any(|e| e.advertisable());
        set.entries.push(HandlerEntry {
            id,
            tx,
            local_only,
            is_reply,
        });
        (
            Registration {
                id,
                first_cluster_handler,
            },
            rx,
        )
    }

    /// Remove a handler by address and id.
    pub(crate) fn remove_handler(&self, address: &str, id: u64) -> Removal {
        let mut handlers = self.handlers.write();
        let Some(set) = handlers.get_mut(address) else {
            return Removal::default();
        };
        let Some(pos) = set.entries.iter().position(|e| e.id == id) else {
            return Removal::default();
        };
        let removed = set.entries.remove(pos);
        let last_cluster_handler =
            removed.advertisable() && !set.entries.iter().any(|e| e.advertisable());
        if set.entries.is_empty() {
            handlers.remove(address);
        }
        Removal {
            found: true,
            last_cluster_handler,
        }
    }

    /// Dispatch a message to the handlers registered at its address.
    ///
    /// Returns whether at least one handler received it. Messages with
    /// no handlers are discarded, matching the best-effort contract.
    pub(crate) fn deliver(&self, msg: &ClusteredMessage) -> bool {
        let mut handlers = self.handlers.write();
        let Some(set) = handlers.get_mut(&msg.address) else {
            return false;
        };
        // Receivers dropped without unregistering leave dead channels.
        set.entries.retain(|e| !e.tx.is_closed());

        let eligible: Vec<usize> = set
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.accepts(msg))
            .map(|(i, _)| i)
            .collect();

        if eligible.is_empty() {
            if set.entries.is_empty() {
                handlers.remove(&msg.address);
            }
            return false;
        }

        let mut delivered = false;
        let mut consumed = Vec::new();
        if msg.is_send {
            let pick = eligible[set.cursor % eligible.len()];
            set.cursor = set.cursor.wrapping_add(1);
            let entry = &set.entries[pick];
            delivered = entry.tx.send(msg.clone()).is_ok();
            if entry.is_reply {
                consumed.push(pick);
            }
        } else {
            for &i in &eligible {
                let entry = &set.entries[i];
                if entry.tx.send(msg.clone()).is_ok() {
                    delivered = true;
                }
                if entry.is_reply {
                    consumed.push(i);
                }
            }
        }

        // Reply handlers are one-shot.
        for i in consumed.into_iter().rev() {
            set.entries.remove(i);
        }
        if set.entries.is_empty() {
            handlers.remove(&msg.address);
        }
        delivered
    }

    /// Number of handlers currently registered at an address.
    pub fn handler_count(&self, address: &str) -> usize {
        self.handlers
            .read()
            .get(address)
            .map_or(0, |set| set.entries.len())
    }

    /// Drop every handler, ending all consumer streams.
    pub(crate) fn close(&self) {
        self.handlers.write().clear();
    }

    fn make_message(
        &self,
        address: &str,
        body: Body,
        options: DeliveryOptions,
        is_send: bool,
    ) -> ClusteredMessage {
        let mut msg = ClusteredMessage::new(self.node.clone(), address, body, is_send);
        msg.headers = options.headers;
        msg.codec_name = options.codec_name;
        msg
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for Arc<LocalBus> {
    async fn send_with(&self, address: &str, body: Body, options: DeliveryOptions) -> Result<()> {
        let msg = self.make_message(address, body, options, true);
        self.deliver(&msg);
        Ok(())
    }

    async fn publish_with(
        &self,
        address: &str,
        body: Body,
        options: DeliveryOptions,
    ) -> Result<()> {
        let msg = self.make_message(address, body, options, false);
        self.deliver(&msg);
        Ok(())
    }

    async fn request_with(
        &self,
        address: &str,
        body: Body,
        options: DeliveryOptions,
    ) -> Result<ClusteredMessage> {
        let reply_address = Uuid::new_v4().to_string();
        let (registration, mut rx) = self.add_handler(&reply_address, false, true);

        let mut msg = self.make_message(address, body, options, true);
        msg.reply_address = Some(reply_address.clone());
        self.deliver(&msg);

        match tokio::time::timeout(self.reply_timeout, rx.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(Error::NotRunning),
            Err(_) => {
                self.remove_handler(&reply_address, registration.id);
                Err(Error::ReplyTimeout(self.reply_timeout))
            }
        }
    }

    async fn reply_with(
        &self,
        to: &ClusteredMessage,
        body: Body,
        options: DeliveryOptions,
    ) -> Result<()> {
        let reply_address = to
            .reply_address
            .clone()
            .ok_or(Error::NoReplyAddress)?;
        let msg = self.make_message(&reply_address, body, options, true);
        self.deliver(&msg);
        Ok(())
    }

    async fn consumer(&self, address: &str) -> Result<MessageConsumer> {
        let (registration, rx) = self.add_handler(address, false, false);
        Ok(MessageConsumer::new(
            address.to_string(),
            registration.id,
            rx,
            ConsumerBus::Local(Arc::clone(self)),
        ))
    }

    async fn local_consumer(&self, address: &str) -> Result<MessageConsumer> {
        let (registration, rx) = self.add_handler(address, true, false);
        Ok(MessageConsumer::new(
            address.to_string(),
            registration.id,
            rx,
            ConsumerBus::Local(Arc::clone(self)),
        ))
    }
}
