use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bincode::{deserialize, serialize};
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use super::{MembershipMessage, MembershipMessageHandler, MembershipTransport, ProbeReply};
use crate::error::TransportError;
use crate::identity::SiloAddress;
use crate::table::TableDelta;

const DEFAULT_MAX_PACKET_SIZE: usize = 8_192;

/// Bincode-over-UDP transport.
pub struct UdpTransport {
    local: SiloAddress,
    socket: Arc<UdpSocket>,
    max_packet_size: usize,
    next_probe_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<SiloAddress>>,
}

/// Drops the pending slot when a probe completes or its caller gives up.
struct PendingProbe<'a> {
    pending: &'a DashMap<u64, oneshot::Sender<SiloAddress>>,
    probe_id: u64,
}

impl Drop for PendingProbe<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.probe_id);
    }
}

impl UdpTransport {
    /// Binds a UDP socket on the local silo's endpoint.
    pub async fn bind(local: SiloAddress) -> Result<Arc<Self>, TransportError> {
        let socket = UdpSocket::bind(local.endpoint).await?;
        Ok(Arc::new(Self {
            local,
            socket: Arc::new(socket),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            next_probe_id: AtomicU64::new(1),
            pending: DashMap::new(),
        }))
    }

    /// Socket address assigned to the underlying socket.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Number of probes awaiting a reply.
    pub fn pending_probes(&self) -> usize {
        self.pending.len()
    }

    /// Fails every outstanding probe with [`TransportError::Closed`].
    pub fn close(&self) {
        self.pending.clear();
    }

    async fn send(&self, message: &MembershipMessage, addr: SocketAddr) -> Result<(), TransportError> {
        let payload =
            serialize(message).map_err(|err| TransportError::Serialization(err.to_string()))?;
        if payload.len() > self.max_packet_size {
            return Err(TransportError::MessageTooLarge(payload.len()));
        }
        self.socket.send_to(&payload, addr).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<(MembershipMessage, SocketAddr), TransportError> {
        let mut buf = vec![0u8; self.max_packet_size];
        let (len, addr) = self.socket.recv_from(&mut buf).await?;
        let message = deserialize(&buf[..len])
            .map_err(|err| TransportError::Serialization(err.to_string()))?;
        Ok((message, addr))
    }

    /// Spawns the receive loop dispatching inbound messages to `handler`.
    pub fn spawn_listener(
        self: &Arc<Self>,
        handler: Arc<dyn MembershipMessageHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = transport.recv() => match received {
                        Ok((message, addr)) => transport.dispatch(handler.as_ref(), message, addr).await,
                        Err(err) => warn!("membership recv error: {err}"),
                    },
                }
            }
            transport.close();
        })
    }

    async fn dispatch(
        &self,
        handler: &dyn MembershipMessageHandler,
        message: MembershipMessage,
        addr: SocketAddr,
    ) {
        match message {
            MembershipMessage::Ping { from, probe_id } => {
                trace!(%from, probe_id, "ping received");
                if let Some(reply) = handler.on_probe(from) {
                    let pong = MembershipMessage::Pong {
                        from: reply.responder,
                        probe_id,
                    };
                    if let Err(err) = self.send(&pong, addr).await {
                        warn!(%from, "failed to answer probe: {err}");
                    }
                }
            }
            MembershipMessage::Pong { from, probe_id } => {
                if let Some((_, sender)) = self.pending.remove(&probe_id) {
                    let _ = sender.send(from);
                }
            }
            MembershipMessage::Gossip { from, delta } => {
                trace!(%from, entries = delta.entries.len(), "gossip received");
                handler.on_gossip(from, delta);
            }
        }
    }
}

#[async_trait]
impl MembershipTransport for UdpTransport {
    async fn probe(&self, target: SiloAddress) -> Result<ProbeReply, TransportError> {
        let probe_id = self.next_probe_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(probe_id, sender);
        let _slot = PendingProbe {
            pending: &self.pending,
            probe_id,
        };

        let ping = MembershipMessage::Ping {
            from: self.local,
            probe_id,
        };
        self.send(&ping, target.endpoint).await?;
        let responder = receiver.await.map_err(|_| TransportError::Closed)?;
        Ok(ProbeReply { responder })
    }

    async fn push_gossip(
        &self,
        target: SiloAddress,
        delta: &TableDelta,
    ) -> Result<(), TransportError> {
        let message = MembershipMessage::Gossip {
            from: self.local,
            delta: delta.clone(),
        };
        self.send(&message, target.endpoint).await
    }
}
