//! Message consumers
//!
//! Registering a handler yields a [`MessageConsumer`]: a channel-backed
//! stream of messages for one address. Unregistration is explicit and
//! async so the cluster-wide subscription can be withdrawn; dropping a
//! consumer without unregistering only removes the local handler.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::bus::clustered::ClusterCore;
use crate::bus::local::LocalBus;
use crate::error::Result;
use crate::protocol::message::ClusteredMessage;

pub(crate) enum ConsumerBus {
    Local(Arc<LocalBus>),
    Clustered(Arc<ClusterCore>),
}

/// Stream of messages delivered to one registered handler
pub struct MessageConsumer {
    address: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<ClusteredMessage>,
    bus: ConsumerBus,
    unregistered: bool,
}

impl MessageConsumer {
    pub(crate) fn new(
        address: String,
        id: u64,
        rx: mpsc::UnboundedReceiver<ClusteredMessage>,
        bus: ConsumerBus,
    ) -> Self {
        Self {
            address,
            id,
            rx,
            bus,
            unregistered: false,
        }
    }

    /// Address this consumer is registered at
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Receive the next message.
    ///
    /// Returns `None` once the handler has been removed and the queue
    /// drained (for reply consumers, after their single delivery).
    pub async fn recv(&mut self) -> Option<ClusteredMessage> {
        self.rx.recv().await
    }

    /// Remove the handler and withdraw its cluster registration when it
    /// was the last advertisable handler at the address.
    ///
    /// Surfaces [`Error::SubNotFound`](crate::Error::SubNotFound) when
    /// the registry held no matching entry to withdraw.
    pub async fn unregister(mut self) -> Result<()> {
        self.unregistered = true;
        match &self.bus {
            ConsumerBus::Local(local) => {
                local.remove_handler(&self.address, self.id);
                Ok(())
            }
            ConsumerBus::Clustered(core) => core.unregister(&self.address, self.id).await,
        }
    }
}

impl Drop for MessageConsumer {
    fn drop(&mut self) {
        if self.unregistered {
            return;
        }
        let local = match &self.bus {
            ConsumerBus::Local(local) => local,
            ConsumerBus::Clustered(core) => core.local(),
        };
        let removal = local.remove_handler(&self.address, self.id);
        if removal.last_cluster_handler {
            tracing::debug!(
                address = %self.address,
                "consumer dropped without unregister; registry entry remains until explicit \
                 withdrawal or node-crash cleanup"
            );
        }
    }
}
