use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::{SeedableRng, rngs::SmallRng};
use tokio::time;
use tracing::{debug, trace, warn};

use crate::cache::{ChangeOrigin, TableChange};
use crate::config::GossipConfig;
use crate::error::TransportError;
use crate::identity::SiloAddress;
use crate::table::{MembershipEntry, MembershipTableSnapshot, TableDelta, TableVersion};
use crate::transport::MembershipTransport;

#[derive(Debug, Default)]
struct PendingDelta {
    version: Option<TableVersion>,
    entries: BTreeMap<SiloAddress, MembershipEntry>,
}

/// Batches locally observed table changes and pushes them to random peers.
///
/// Delivery is best effort: failed or slow pushes are dropped, never retried.
/// Only rows that did not fit in a flush stay queued.
pub struct GossipDisseminator {
    local: SiloAddress,
    config: GossipConfig,
    send_timeout: Duration,
    transport: Arc<dyn MembershipTransport>,
    pending: Mutex<PendingDelta>,
    rng: Mutex<SmallRng>,
}

impl GossipDisseminator {
    /// Creates a disseminator; each push is bounded by `send_timeout`.
    pub fn new(
        local: SiloAddress,
        config: GossipConfig,
        send_timeout: Duration,
        transport: Arc<dyn MembershipTransport>,
    ) -> Self {
        Self {
            local,
            config,
            send_timeout,
            transport,
            pending: Mutex::new(PendingDelta::default()),
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    /// Queues the rows of a local write or refresh. Changes that arrived by
    /// gossip are not re-pushed.
    pub fn enqueue(&self, change: &TableChange) -> bool {
        if !self.config.enabled || change.origin == ChangeOrigin::Gossip || change.changed.is_empty()
        {
            return false;
        }

        let mut pending = self.pending.lock();
        for row in &change.changed {
            let newer = pending
                .entries
                .get(&row.silo)
                .is_none_or(|queued| row.row_version > queued.row_version);
            if newer {
                pending.entries.insert(row.silo, row.clone());
            }
        }
        if pending
            .version
            .as_ref()
            .is_none_or(|queued| change.version.version > queued.version)
        {
            pending.version = Some(change.version.clone());
        }
        true
    }

    /// Rows waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().entries.len()
    }

    /// Up to `fanout` random non-Dead peers.
    pub fn choose_targets(&self, snapshot: &MembershipTableSnapshot) -> Vec<SiloAddress> {
        let mut peers: Vec<SiloAddress> = snapshot
            .entries()
            .filter(|entry| entry.silo != self.local && !entry.status.is_terminal())
            .map(|entry| entry.silo)
            .collect();
        {
            let mut rng = self.rng.lock();
            peers.shuffle(&mut *rng);
        }
        peers.truncate(self.config.fanout);
        peers
    }

    /// Sends up to `max_batch_entries` queued rows, newest first, to a random
    /// subset of peers and leaves the rest queued. A freshly Dead row is also
    /// pushed once to the silo it names, so that silo stops without waiting
    /// for its next table read. Returns the number of peers that accepted the
    /// whole batch.
    pub async fn flush(&self, snapshot: &MembershipTableSnapshot) -> usize {
        let (version, batch) = {
            let mut pending = self.pending.lock();
            let Some(version) = pending.version.clone() else {
                return 0;
            };
            let mut rows: Vec<MembershipEntry> =
                std::mem::take(&mut pending.entries).into_values().collect();
            rows.sort_by(|a, b| b.row_version.cmp(&a.row_version));
            let rest = rows.split_off(rows.len().min(self.config.max_batch_entries.max(1)));
            if rest.is_empty() {
                pending.version = None;
            } else {
                pending.entries = rest.into_iter().map(|row| (row.silo, row)).collect();
            }
            (version, rows)
        };

        let targets = self.choose_targets(snapshot);
        let sends = targets
            .iter()
            .map(|target| self.push_batch(*target, &version, &batch));
        let delivered = join_all(sends).await.into_iter().filter(|ok| *ok).count();

        let evicted = batch
            .iter()
            .filter(|row| row.status.is_terminal() && row.silo != self.local)
            .map(|row| self.push_batch(row.silo, &version, std::slice::from_ref(row)));
        join_all(evicted).await;

        if targets.is_empty() {
            trace!(silo = %self.local, "no gossip peers");
        } else {
            trace!(
                silo = %self.local,
                entries = batch.len(),
                remaining = self.pending_len(),
                delivered,
                "gossip flushed"
            );
        }
        delivered
    }

    /// Pushes `rows` to `target`, halving any delta the transport rejects as
    /// too large. Returns `true` when every row went out.
    async fn push_batch(
        &self,
        target: SiloAddress,
        version: &TableVersion,
        rows: &[MembershipEntry],
    ) -> bool {
        let mut chunks = vec![rows];
        let mut complete = true;
        while let Some(chunk) = chunks.pop() {
            let delta = TableDelta {
                version: version.clone(),
                entries: chunk.to_vec(),
            };
            match time::timeout(self.send_timeout, self.transport.push_gossip(target, &delta)).await {
                Ok(Ok(())) => {}
                Ok(Err(TransportError::MessageTooLarge(size))) if chunk.len() > 1 => {
                    trace!(%target, size, entries = chunk.len(), "splitting oversized gossip delta");
                    let (newer, older) = chunk.split_at(chunk.len() / 2);
                    chunks.push(older);
                    chunks.push(newer);
                }
                Ok(Err(TransportError::MessageTooLarge(size))) => {
                    if let Some(row) = chunk.first() {
                        warn!(%target, row = %row.silo, size, "membership row does not fit in one gossip message");
                    }
                    complete = false;
                }
                Ok(Err(err)) => {
                    debug!(%target, "gossip push failed: {err}");
                    return false;
                }
                Err(_) => {
                    debug!(%target, "gossip push timed out");
                    return false;
                }
            }
        }
        complete
    }
}
