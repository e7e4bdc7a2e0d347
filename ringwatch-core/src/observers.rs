use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;

use crate::identity::SiloAddress;
use crate::table::{MembershipTableSnapshot, SiloStatus};

/// Receives every new table snapshot. Called on the agent's notification
/// task, so implementations should return quickly.
pub trait MembershipObserver: Send + Sync {
    /// Handles a replaced snapshot.
    fn on_table_changed(&self, snapshot: &MembershipTableSnapshot);
}

/// Fan-out of snapshot changes to registered observers.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: RwLock<Vec<Arc<dyn MembershipObserver>>>,
}

impl ObserverRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an observer.
    pub fn register(&self, observer: Arc<dyn MembershipObserver>) {
        self.observers.write().push(observer);
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// Returns `true` when no observer is registered.
    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    /// Delivers `snapshot` to every observer.
    pub fn notify(&self, snapshot: &MembershipTableSnapshot) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.on_table_changed(snapshot);
        }
    }
}

/// A silo clients may connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEntry {
    /// Gateway silo.
    pub silo: SiloAddress,
    /// Client-facing endpoint.
    pub endpoint: SocketAddr,
    /// Role label, if any.
    pub role: Option<String>,
}

/// Read-only, eventually consistent list of Active gateways.
pub struct GatewayListProvider {
    gateways: watch::Sender<Arc<Vec<GatewayEntry>>>,
}

impl Default for GatewayListProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayListProvider {
    /// Creates a provider with an empty list.
    #[must_use]
    pub fn new() -> Self {
        let (gateways, _) = watch::channel(Arc::new(Vec::new()));
        Self { gateways }
    }

    /// Current gateway list.
    pub fn gateways(&self) -> Arc<Vec<GatewayEntry>> {
        Arc::clone(&self.gateways.borrow())
    }

    /// Watches gateway list replacements.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<GatewayEntry>>> {
        self.gateways.subscribe()
    }

    /// Active silos with a proxy port, ordered by identity.
    #[must_use]
    pub fn compute(snapshot: &MembershipTableSnapshot) -> Vec<GatewayEntry> {
        snapshot
            .entries()
            .filter(|entry| entry.status == SiloStatus::Active)
            .filter_map(|entry| {
                entry.gateway_endpoint().map(|endpoint| GatewayEntry {
                    silo: entry.silo,
                    endpoint,
                    role: entry.role.clone(),
                })
            })
            .collect()
    }
}

impl MembershipObserver for GatewayListProvider {
    fn on_table_changed(&self, snapshot: &MembershipTableSnapshot) {
        let next = Self::compute(snapshot);
        self.gateways.send_if_modified(|current| {
            if **current == next {
                return false;
            }
            debug!(gateways = next.len(), version = snapshot.version.version, "gateway list updated");
            *current = Arc::new(next);
            true
        });
    }
}
