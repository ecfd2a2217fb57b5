//! Per-peer outbound connection state machine
//!
//! One holder per peer node, created lazily on the first send and
//! cached in the shared connections map. The holder's bounded channel
//! is the pending-write queue: messages enqueued while the TCP connect
//! is in flight are drained in insertion order once the socket is up,
//! which (with TCP FIFO) gives per-peer ordering.
//!
//! State machine: CONNECTING → READY → CLOSED, with CLOSED terminal.
//! Any connect, write or keepalive failure closes the holder and evicts
//! it from the connections map under the same key guard used for
//! creation, so the next send to that peer starts a fresh holder.
//! Messages still queued on a closed holder are dropped; delivery is
//! best-effort.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::cluster::node::NodeAddress;
use crate::server::config::EventBusOptions;

/// Shared map of live holders, one per peer.
pub(crate) type Connections = Arc<DashMap<NodeAddress, Arc<ConnectionHolder>>>;

/// Holder lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HolderState {
    /// TCP connect in flight; writes queue up
    Connecting,
    /// Socket established; writes go straight through
    Ready,
    /// Terminal; the holder has been (or is being) evicted
    Closed,
}

const STATE_CONNECTING: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// The holder refused a write because it is already closed.
///
/// Callers recover by re-looking-up the connections map, which creates
/// a fresh holder.
#[derive(Debug)]
pub(crate) struct HolderClosed;

/// Outbound connection to one peer
pub(crate) struct ConnectionHolder {
    peer: NodeAddress,
    tx: mpsc::Sender<Bytes>,
    state: AtomicU8,
    shutdown: Notify,
}

impl ConnectionHolder {
    /// Create a holder and start its connect/write task.
    ///
    /// `ping_record` is the pre-encoded keepalive record written every
    /// ping interval.
    pub(crate) fn spawn(
        peer: NodeAddress,
        options: &EventBusOptions,
        ping_record: Bytes,
        connections: Connections,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(options.pending_queue_capacity);
        let holder = Arc::new(Self {
            peer,
            tx,
            state: AtomicU8::new(STATE_CONNECTING),
            shutdown: Notify::new(),
        });
        tokio::spawn(Self::run(
            Arc::clone(&holder),
            rx,
            options.connect_timeout,
            options.ping_interval,
            ping_record,
            connections,
        ));
        holder
    }

    /// Enqueue an already-framed message for this peer.
    ///
    /// A full queue drops the message (logged); a closed holder rejects
    /// the write so the caller can retry on a fresh holder.
    pub(crate) fn write(&self, framed: Bytes) -> Result<(), HolderClosed> {
        if self.state() == HolderState::Closed {
            return Err(HolderClosed);
        }
        match self.tx.try_send(framed) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(peer = %self.peer, "pending queue full; dropping message");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(HolderClosed),
        }
    }

    /// Ask the holder to close; its task evicts it from the map.
    pub(crate) fn close(&self) {
        self.shutdown.notify_one();
    }

    /// Current lifecycle state.
    pub(crate) fn state(&self) -> HolderState {
        match self.state.load(Ordering::Acquire) {
            STATE_CONNECTING => HolderState::Connecting,
            STATE_READY => HolderState::Ready,
            _ => HolderState::Closed,
        }
    }

    async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Bytes>,
        connect_timeout: std::time::Duration,
        ping_interval: std::time::Duration,
        ping_record: Bytes,
        connections: Connections,
    ) {
        let target = (self.peer.host.as_str(), self.peer.port);
        let stream =
            match tokio::time::timeout(connect_timeout, TcpStream::connect(target)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!(peer = %self.peer, error = %e, "connect failed");
                    self.finish(&connections);
                    return;
                }
                Err(_) => {
                    warn!(peer = %self.peer, "connect timed out");
                    self.finish(&connections);
                    return;
                }
            };
        let _ = stream.set_nodelay(true);
        let (mut read_half, mut write_half) = stream.into_split();
        self.state.store(STATE_READY, Ordering::Release);
        debug!(peer = %self.peer, "peer connection ready");

        // Outbound sockets are write-mostly: any inbound byte counts as
        // a PONG acknowledgement, everything else is ignored.
        let awaiting_pong = Arc::new(AtomicBool::new(false));
        let reader = {
            let awaiting_pong = Arc::clone(&awaiting_pong);
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                loop {
                    match read_half.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => awaiting_pong.store(false, Ordering::Release),
                    }
                }
            })
        };

        let mut ping = tokio::time::interval(ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    debug!(peer = %self.peer, "closing peer connection");
                    break;
                }
                queued = rx.recv() => {
                    let Some(framed) = queued else { break };
                    if let Err(e) = write_half.write_all(&framed).await {
                        warn!(peer = %self.peer, error = %e, "write failed");
                        break;
                    }
                }
                _ = ping.tick() => {
                    if awaiting_pong.swap(true, Ordering::AcqRel) {
                        warn!(peer = %self.peer, "no pong within ping interval");
                        break;
                    }
                    if let Err(e) = write_half.write_all(&ping_record).await {
                        warn!(peer = %self.peer, error = %e, "ping write failed");
                        break;
                    }
                }
            }
        }

        reader.abort();
        let _ = write_half.shutdown().await;
        self.finish(&connections);
    }

    /// Move to CLOSED and evict this exact holder from the map.
    fn finish(self: &Arc<Self>, connections: &Connections) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        connections.remove_if(&self.peer, |_, holder| Arc::ptr_eq(holder, self));
        debug!(peer = %self.peer, "peer connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options() -> EventBusOptions {
        EventBusOptions::default()
            .connect_timeout(Duration::from_millis(500))
            .ping_interval(Duration::from_secs(60))
    }

    fn connections() -> Connections {
        Arc::new(DashMap::new())
    }

    #[tokio::test]
    async fn connect_failure_evicts_holder() {
        let conns = connections();
        // Port 1 on loopback: nothing listens there.
        let peer = NodeAddress::new("127.0.0.1", 1);
        let holder = ConnectionHolder::spawn(
            peer.clone(),
            &options(),
            Bytes::from_static(b"ping"),
            Arc::clone(&conns),
        );
        conns.insert(peer.clone(), Arc::clone(&holder));

        for _ in 0..100 {
            if holder.state() == HolderState::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(holder.state(), HolderState::Closed);
        assert!(conns.get(&peer).is_none());
        assert!(holder.write(Bytes::from_static(b"late")).is_err());
    }

    #[tokio::test]
    async fn queued_writes_drain_after_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = NodeAddress::new("127.0.0.1", addr.port());

        let conns = connections();
        let holder = ConnectionHolder::spawn(
            peer.clone(),
            &options(),
            Bytes::from_static(b"ping"),
            Arc::clone(&conns),
        );
        conns.insert(peer, Arc::clone(&holder));

        // Enqueue before the accept happens: these sit in the pending
        // queue until the connection is ready.
        holder.write(Bytes::from_static(b"first")).unwrap();
        holder.write(Bytes::from_static(b"second")).unwrap();

        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 11];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"firstsecond");

        holder.close();
        for _ in 0..100 {
            if holder.state() == HolderState::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(holder.state(), HolderState::Closed);
    }

    #[tokio::test]
    async fn missed_pong_closes_holder() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = NodeAddress::new("127.0.0.1", addr.port());

        let opts = options().ping_interval(Duration::from_millis(30));
        let conns = connections();
        let holder = ConnectionHolder::spawn(
            peer,
            &opts,
            Bytes::from_static(b"ping"),
            Arc::clone(&conns),
        );

        // Accept but never answer pings.
        let (_socket, _) = listener.accept().await.unwrap();

        for _ in 0..100 {
            if holder.state() == HolderState::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(holder.state(), HolderState::Closed);
    }
}
