use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{debug, error};

use crate::config::RetryConfig;
use crate::error::StoreError;
use crate::store::MembershipTableStore;
use crate::store::retry::with_retry;
use crate::table::{MembershipEntry, MembershipTableSnapshot, TableDelta, TableVersion};

/// Where a cache change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A successful write by this silo.
    LocalWrite,
    /// A full read of the store.
    Refresh,
    /// A delta pushed by a peer.
    Gossip,
}

/// Rows that changed in the cache, published after every effective merge.
#[derive(Debug, Clone)]
pub struct TableChange {
    /// Source of the change.
    pub origin: ChangeOrigin,
    /// Cache version after the merge.
    pub version: TableVersion,
    /// Rows that replaced their cached counterparts.
    pub changed: Vec<MembershipEntry>,
}

/// Result of feeding a peer's delta into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// At least one row was newer than the cached copy.
    Applied {
        /// Number of rows that changed.
        changed: usize,
    },
    /// Nothing in the delta was newer.
    Stale,
}

/// This silo's view of the membership table.
///
/// Readers get a whole `Arc` snapshot that is never mutated; every update
/// builds a new snapshot and swaps it in.
pub struct MembershipTableCache {
    store: Arc<dyn MembershipTableStore>,
    retry: RetryConfig,
    snapshots: watch::Sender<Arc<MembershipTableSnapshot>>,
    changes: broadcast::Sender<TableChange>,
}

impl std::fmt::Debug for MembershipTableCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipTableCache")
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

impl MembershipTableCache {
    /// Creates an empty cache over `store`.
    pub fn new(store: Arc<dyn MembershipTableStore>, retry: RetryConfig) -> Self {
        let (snapshots, _) = watch::channel(Arc::new(MembershipTableSnapshot::empty()));
        let (changes, _) = broadcast::channel(256);
        Self {
            store,
            retry,
            snapshots,
            changes,
        }
    }

    /// Latest snapshot.
    pub fn current(&self) -> Arc<MembershipTableSnapshot> {
        Arc::clone(&self.snapshots.borrow())
    }

    /// Version of the latest snapshot.
    pub fn version(&self) -> TableVersion {
        self.snapshots.borrow().version.clone()
    }

    /// Version of the last complete view of the table; see
    /// [`MembershipTableSnapshot::read_version`].
    pub fn read_version(&self) -> TableVersion {
        self.snapshots.borrow().read_version().clone()
    }

    /// Watches whole-snapshot replacements.
    pub fn subscribe(&self) -> watch::Receiver<Arc<MembershipTableSnapshot>> {
        self.snapshots.subscribe()
    }

    /// Receives the changed rows of every effective merge.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<TableChange> {
        self.changes.subscribe()
    }

    /// Store backing this cache.
    pub fn store(&self) -> &Arc<dyn MembershipTableStore> {
        &self.store
    }

    /// Retry schedule used for store calls.
    pub const fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Merges a delta pushed by a peer. Applying the same delta twice is a no-op.
    pub fn apply_delta(&self, delta: TableDelta) -> DeltaOutcome {
        let changed = self.merge(ChangeOrigin::Gossip, &delta.version, delta.entries);
        if changed == 0 {
            DeltaOutcome::Stale
        } else {
            DeltaOutcome::Applied { changed }
        }
    }

    /// Folds this silo's own successful write into the cache without a read.
    pub fn record_write(&self, version: &TableVersion, row: MembershipEntry) {
        self.merge(ChangeOrigin::LocalWrite, version, std::iter::once(row));
    }

    /// Reads the whole table and merges it.
    ///
    /// # Errors
    ///
    /// Returns the store error once the retry budget is exhausted; the cached
    /// snapshot is left untouched.
    pub async fn refresh(&self) -> Result<Arc<MembershipTableSnapshot>, StoreError> {
        self.refresh_with(&self.retry).await
    }

    /// [`refresh`](Self::refresh) under an explicit retry schedule.
    ///
    /// # Errors
    ///
    /// Returns the store error once `retry` is exhausted.
    pub async fn refresh_with(
        &self,
        retry: &RetryConfig,
    ) -> Result<Arc<MembershipTableSnapshot>, StoreError> {
        let readout = with_retry(retry, "read_all", || self.store.read_all()).await?;
        for record in &readout.corrupt {
            error!(key = %record.key, reason = %record.reason, "skipping corrupt membership row");
        }
        self.merge(ChangeOrigin::Refresh, &readout.version, readout.entries);
        Ok(self.current())
    }

    fn merge(
        &self,
        origin: ChangeOrigin,
        version: &TableVersion,
        entries: impl IntoIterator<Item = MembershipEntry>,
    ) -> usize {
        let mut changed = Vec::new();
        let mut merged_version = None;
        self.snapshots.send_if_modified(|current| {
            let (mut next, rows) = current.merge(version, entries);
            match origin {
                ChangeOrigin::Refresh => next.mark_read(version),
                // Only our write happened since the last complete read.
                ChangeOrigin::LocalWrite
                    if version.version == current.read_version().version + 1 =>
                {
                    next.mark_read(version);
                }
                ChangeOrigin::LocalWrite | ChangeOrigin::Gossip => {}
            }
            if rows.is_empty()
                && next.version == current.version
                && next.read_version() == current.read_version()
            {
                return false;
            }
            merged_version = Some(next.version.clone());
            changed = rows;
            *current = Arc::new(next);
            true
        });

        let count = changed.len();
        if let Some(version) = merged_version {
            debug!(?origin, version = version.version, changed = count, "membership cache updated");
            if count > 0 {
                let _ = self.changes.send(TableChange {
                    origin,
                    version,
                    changed,
                });
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SiloAddress;
    use crate::store::memory::InMemoryMembershipTable;
    use crate::store::{InsertOutcome, MembershipTableStore};
    use crate::table::SiloStatus;
    use chrono::Utc;
    use std::net::SocketAddr;

    fn joining(port: u16) -> MembershipEntry {
        let silo = SiloAddress::new(SocketAddr::from(([127, 0, 0, 1], port)), 1);
        MembershipEntry::joining(silo, format!("silo-{port}"), "host", Utc::now())
    }

    fn cache_over(table: &Arc<InMemoryMembershipTable>) -> MembershipTableCache {
        let store: Arc<dyn MembershipTableStore> = table.clone();
        MembershipTableCache::new(store, RetryConfig::default())
    }

    #[tokio::test]
    async fn refresh_skips_corrupt_rows() {
        let table = Arc::new(InMemoryMembershipTable::new());
        let good = joining(1);
        let bad = joining(2);
        table.insert_row(good.clone()).await.unwrap();
        table.insert_row(bad.clone()).await.unwrap();
        table.corrupt_row(&bad.silo);

        let cache = cache_over(&table);
        let snapshot = cache.refresh().await.unwrap();

        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get(&good.silo).is_some());
        assert_eq!(snapshot.version.version, 2);
    }

    #[tokio::test]
    async fn duplicate_delta_is_stale() {
        let table = Arc::new(InMemoryMembershipTable::new());
        let InsertOutcome::Inserted { version, mut row } =
            table.insert_row(joining(1)).await.unwrap()
        else {
            panic!("insert must succeed");
        };
        row.status = SiloStatus::Active;

        let cache = cache_over(&table);
        let delta = TableDelta {
            version,
            entries: vec![row],
        };
        assert_eq!(cache.apply_delta(delta.clone()), DeltaOutcome::Applied { changed: 1 });
        let once = cache.current();
        assert_eq!(cache.apply_delta(delta), DeltaOutcome::Stale);
        assert_eq!(*cache.current(), *once);
    }

    #[tokio::test]
    async fn changes_are_tagged_with_origin() {
        let table = Arc::new(InMemoryMembershipTable::new());
        let cache = cache_over(&table);
        let mut changes = cache.subscribe_changes();

        let InsertOutcome::Inserted { version, row } =
            table.insert_row(joining(1)).await.unwrap()
        else {
            panic!("insert must succeed");
        };
        cache.record_write(&version, row);
        table.insert_row(joining(2)).await.unwrap();
        cache.refresh().await.unwrap();

        let first = changes.recv().await.unwrap();
        assert_eq!(first.origin, ChangeOrigin::LocalWrite);
        let second = changes.recv().await.unwrap();
        assert_eq!(second.origin, ChangeOrigin::Refresh);
        assert_eq!(second.changed.len(), 1);
        assert_eq!(second.version.version, 2);
    }

    #[tokio::test]
    async fn gossip_does_not_advance_read_version() {
        let table = Arc::new(InMemoryMembershipTable::new());
        table.insert_row(joining(1)).await.unwrap();
        let cache = cache_over(&table);
        cache.refresh().await.unwrap();
        assert_eq!(cache.read_version().version, 1);

        let InsertOutcome::Inserted { version, row } =
            table.insert_row(joining(2)).await.unwrap()
        else {
            panic!("insert must succeed");
        };
        cache.apply_delta(TableDelta {
            version,
            entries: vec![row],
        });
        assert_eq!(cache.version().version, 2);
        assert_eq!(cache.read_version().version, 1);

        // A write two versions past the last read may have skipped a row.
        let InsertOutcome::Inserted { version, row } =
            table.insert_row(joining(3)).await.unwrap()
        else {
            panic!("insert must succeed");
        };
        cache.record_write(&version, row);
        assert_eq!(cache.version().version, 3);
        assert_eq!(cache.read_version().version, 1);

        cache.refresh().await.unwrap();
        assert_eq!(cache.read_version().version, 3);
        let InsertOutcome::Inserted { version, row } =
            table.insert_row(joining(4)).await.unwrap()
        else {
            panic!("insert must succeed");
        };
        cache.record_write(&version, row);
        assert_eq!(cache.read_version().version, 4);
    }

    #[tokio::test]
    async fn outage_keeps_last_snapshot() {
        let table = Arc::new(InMemoryMembershipTable::new());
        table.insert_row(joining(1)).await.unwrap();
        let store: Arc<dyn MembershipTableStore> = table.clone();
        let cache = MembershipTableCache::new(
            store,
            RetryConfig {
                max_attempts: 1,
                ..RetryConfig::default()
            },
        );
        cache.refresh().await.unwrap();

        table.set_available(false);
        assert!(cache.refresh().await.is_err());
        assert_eq!(cache.current().len(), 1);
    }
}
