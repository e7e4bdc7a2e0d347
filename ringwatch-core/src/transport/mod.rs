//! Peer-to-peer probe and gossip exchange.
//!
//! The sending side is [`MembershipTransport`]; the receiving side is a
//! [`MembershipMessageHandler`], normally the membership agent. Probe
//! deadlines are applied by the caller, so a transport only has to deliver.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::identity::SiloAddress;
use crate::table::TableDelta;

pub mod local;
pub mod udp;

/// Wire message exchanged between silos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipMessage {
    /// Liveness probe.
    Ping {
        /// Prober identity.
        from: SiloAddress,
        /// Correlates the reply with the pending probe.
        probe_id: u64,
    },
    /// Probe reply.
    Pong {
        /// Identity of the responder, including its generation.
        from: SiloAddress,
        /// Identifier copied from the ping.
        probe_id: u64,
    },
    /// Fire-and-forget table delta.
    Gossip {
        /// Sender identity.
        from: SiloAddress,
        /// Rows the sender saw change.
        delta: TableDelta,
    },
}

/// Answer to a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReply {
    /// Identity that answered.
    pub responder: SiloAddress,
}

/// Outbound side of the membership protocol.
#[async_trait]
pub trait MembershipTransport: Send + Sync {
    /// Sends a probe to `target` and resolves when it answers.
    ///
    /// Never resolves if the target stays silent; callers wrap it in a timeout.
    async fn probe(&self, target: SiloAddress) -> Result<ProbeReply, TransportError>;

    /// Pushes a delta to `target` without waiting for any acknowledgement.
    async fn push_gossip(&self, target: SiloAddress, delta: &TableDelta)
    -> Result<(), TransportError>;
}

/// Inbound side of the membership protocol.
pub trait MembershipMessageHandler: Send + Sync {
    /// Identity this handler answers as.
    fn local_silo(&self) -> SiloAddress;

    /// Handles a probe; `None` means stay silent.
    fn on_probe(&self, from: SiloAddress) -> Option<ProbeReply>;

    /// Handles a pushed delta.
    fn on_gossip(&self, from: SiloAddress, delta: TableDelta);
}
