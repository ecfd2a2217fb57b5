//! Inbound peer listener
//!
//! Accepts connections from other cluster nodes. Each accepted socket
//! gets its own record parser; decoded messages are marked as coming
//! from the wire and handed straight to the local bus. Keepalive PING
//! payloads are answered inline with the single PONG byte, the only
//! thing this server ever writes. A payload that fails to decode
//! closes the offending socket.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::bus::local::LocalBus;
use crate::error::Result;
use crate::protocol::codec::CodecRegistry;
use crate::protocol::frame::{RecordParser, PONG};
use crate::protocol::message::ClusteredMessage;
use crate::stats::BusMetrics;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// TCP listener receiving messages from peer nodes
pub(crate) struct PeerServer {
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl PeerServer {
    /// Bind the listener and start accepting.
    ///
    /// Binding port 0 picks a free port; the actual one is available
    /// through [`local_addr`](Self::local_addr).
    pub(crate) async fn bind(
        host: &str,
        port: u16,
        max_record_size: usize,
        local: Arc<LocalBus>,
        codecs: Arc<CodecRegistry>,
        metrics: Arc<dyn BusMetrics>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "cluster listener bound");

        let shutdown = Arc::new(Notify::new());
        let handle = {
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.notified() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((socket, peer_addr)) => {
                                debug!(peer = %peer_addr, "peer connected");
                                let local = Arc::clone(&local);
                                let codecs = Arc::clone(&codecs);
                                let metrics = Arc::clone(&metrics);
                                tokio::spawn(handle_socket(
                                    socket,
                                    peer_addr,
                                    max_record_size,
                                    local,
                                    codecs,
                                    metrics,
                                ));
                            }
                            Err(e) => {
                                error!(error = %e, "failed to accept peer connection");
                            }
                        }
                    }
                }
            })
        };

        Ok(Self {
            local_addr,
            shutdown,
            handle,
        })
    }

    /// Address the listener actually bound.
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and tear the accept loop down.
    pub(crate) async fn close(self) -> Result<()> {
        self.shutdown.notify_waiters();
        self.handle.abort();
        let _ = self.handle.await;
        Ok(())
    }
}

async fn handle_socket(
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    max_record_size: usize,
    local: Arc<LocalBus>,
    codecs: Arc<CodecRegistry>,
    metrics: Arc<dyn BusMetrics>,
) {
    let mut parser = RecordParser::new(max_record_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) => {
                debug!(peer = %peer_addr, "peer disconnected");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(peer = %peer_addr, error = %e, "peer read failed");
                return;
            }
        };
        parser.push(&buf[..n]);

        loop {
            let payload = match parser.next_record() {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %peer_addr, error = %e, "bad record; closing peer socket");
                    return;
                }
            };
            let size = payload.len();
            let msg = match ClusteredMessage::decode(payload, &codecs) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(peer = %peer_addr, error = %e, "undecodable message; closing peer socket");
                    return;
                }
            };
            if msg.is_ping() {
                if let Err(e) = socket.write_all(&[PONG]).await {
                    debug!(peer = %peer_addr, error = %e, "pong write failed");
                    return;
                }
                continue;
            }
            metrics.message_read(&msg.address, size);
            local.deliver(&msg);
        }
    }
}
