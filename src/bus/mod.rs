//! The event bus: node-local dispatch and its clustered overlay.
//!
//! [`LocalBus`] delivers messages between handlers inside one process.
//! [`ClusteredEventBus`] composes a local bus with the peer fabric and
//! the replicated subscription registry so the same operations work
//! across nodes. Both implement the [`EventBus`] capability trait.

pub(crate) mod clustered;
pub(crate) mod consumer;
pub(crate) mod local;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::codec::Body;
use crate::protocol::message::{ClusteredMessage, Headers};

pub use clustered::{ClusteredEventBus, NodeState, SERVER_ID_HA_KEY, SUBS_MAP_NAME};
pub use consumer::MessageConsumer;
pub use local::LocalBus;

/// Per-message delivery options
#[derive(Debug, Clone, Default)]
pub struct DeliveryOptions {
    /// Headers attached to the message
    pub headers: Headers,
    /// User codec to encode the body with; `None` uses the system codec
    /// matching the body shape
    pub codec_name: Option<String>,
}

impl DeliveryOptions {
    /// Create empty delivery options
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a header
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(key, value);
        self
    }

    /// Select a user codec by name
    pub fn codec_name(mut self, name: impl Into<String>) -> Self {
        self.codec_name = Some(name.into());
        self
    }
}

/// Capability set shared by the local bus and its clustered overlay
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Send `body` to one handler registered at `address`.
    async fn send(&self, address: &str, body: Body) -> Result<()> {
        self.send_with(address, body, DeliveryOptions::default())
            .await
    }

    /// Send with explicit delivery options.
    async fn send_with(&self, address: &str, body: Body, options: DeliveryOptions) -> Result<()>;

    /// Publish `body` to every handler registered at `address`.
    async fn publish(&self, address: &str, body: Body) -> Result<()> {
        self.publish_with(address, body, DeliveryOptions::default())
            .await
    }

    /// Publish with explicit delivery options.
    async fn publish_with(&self, address: &str, body: Body, options: DeliveryOptions)
        -> Result<()>;

    /// Send and wait for a single reply.
    async fn request(&self, address: &str, body: Body) -> Result<ClusteredMessage> {
        self.request_with(address, body, DeliveryOptions::default())
            .await
    }

    /// Request with explicit delivery options.
    async fn request_with(
        &self,
        address: &str,
        body: Body,
        options: DeliveryOptions,
    ) -> Result<ClusteredMessage>;

    /// Answer a message that carries a reply address.
    async fn reply(&self, to: &ClusteredMessage, body: Body) -> Result<()> {
        self.reply_with(to, body, DeliveryOptions::default()).await
    }

    /// Reply with explicit delivery options.
    async fn reply_with(
        &self,
        to: &ClusteredMessage,
        body: Body,
        options: DeliveryOptions,
    ) -> Result<()>;

    /// Register a handler at `address`, visible to the whole cluster.
    async fn consumer(&self, address: &str) -> Result<MessageConsumer>;

    /// Register a handler at `address` that only receives messages
    /// originated on this node.
    async fn local_consumer(&self, address: &str) -> Result<MessageConsumer>;
}
