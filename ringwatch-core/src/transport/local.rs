use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::trace;

use super::{MembershipMessageHandler, MembershipTransport, ProbeReply};
use crate::error::TransportError;
use crate::identity::SiloAddress;
use crate::table::TableDelta;

/// In-process network connecting silos of one test or simulation.
///
/// Isolated silos neither send nor receive: probes to or from them never
/// resolve and gossip is dropped.
#[derive(Default)]
pub struct LocalNetwork {
    handlers: DashMap<SocketAddr, Weak<dyn MembershipMessageHandler>>,
    isolated: RwLock<HashSet<SocketAddr>>,
}

impl LocalNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attaches `handler` at its silo's endpoint, replacing any earlier incarnation.
    pub fn register(&self, handler: &Arc<dyn MembershipMessageHandler>) {
        let endpoint = handler.local_silo().endpoint;
        self.handlers.insert(endpoint, Arc::downgrade(handler));
    }

    /// Detaches whatever handler listens on `silo`'s endpoint.
    pub fn unregister(&self, silo: &SiloAddress) {
        self.handlers.remove(&silo.endpoint);
    }

    /// Cuts `silo` off from every peer.
    pub fn isolate(&self, silo: &SiloAddress) {
        self.isolated.write().insert(silo.endpoint);
    }

    /// Reconnects `silo`.
    pub fn heal(&self, silo: &SiloAddress) {
        self.isolated.write().remove(&silo.endpoint);
    }

    /// Returns `true` while `silo` is isolated.
    pub fn is_isolated(&self, silo: &SiloAddress) -> bool {
        self.isolated.read().contains(&silo.endpoint)
    }

    /// Sending side bound to `local`.
    #[must_use]
    pub fn transport_for(self: &Arc<Self>, local: SiloAddress) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            local,
            network: Arc::clone(self),
        })
    }

    fn is_cut(&self, from: &SiloAddress, to: &SiloAddress) -> bool {
        let isolated = self.isolated.read();
        isolated.contains(&from.endpoint) || isolated.contains(&to.endpoint)
    }

    fn handler(&self, target: &SiloAddress) -> Option<Arc<dyn MembershipMessageHandler>> {
        self.handlers
            .get(&target.endpoint)
            .and_then(|handler| handler.upgrade())
    }
}

/// [`MembershipTransport`] over a [`LocalNetwork`].
pub struct LocalTransport {
    local: SiloAddress,
    network: Arc<LocalNetwork>,
}

impl LocalTransport {
    /// Network this transport sends on.
    #[must_use]
    pub const fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }
}

#[async_trait]
impl MembershipTransport for LocalTransport {
    async fn probe(&self, target: SiloAddress) -> Result<ProbeReply, TransportError> {
        if self.network.is_cut(&self.local, &target) {
            trace!(from = %self.local, %target, "probe dropped by partition");
            return std::future::pending().await;
        }
        let handler = self
            .network
            .handler(&target)
            .ok_or(TransportError::Unreachable(target))?;
        match handler.on_probe(self.local) {
            Some(reply) => Ok(reply),
            None => std::future::pending().await,
        }
    }

    async fn push_gossip(
        &self,
        target: SiloAddress,
        delta: &TableDelta,
    ) -> Result<(), TransportError> {
        if self.network.is_cut(&self.local, &target) {
            trace!(from = %self.local, %target, "gossip dropped by partition");
            return Ok(());
        }
        let handler = self
            .network
            .handler(&target)
            .ok_or(TransportError::Unreachable(target))?;
        handler.on_gossip(self.local, delta.clone());
        Ok(())
    }
}
