use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::cache::MembershipTableCache;
use crate::error::MembershipError;
use crate::identity::SiloAddress;
use crate::store::retry::with_retry;
use crate::store::{ColumnUpdate, WriteOutcome};

/// Writes the local silo's `i_am_alive_time` through a column merge.
pub struct HeartbeatPublisher {
    local: SiloAddress,
    cache: Arc<MembershipTableCache>,
    max_attempts: usize,
}

impl HeartbeatPublisher {
    /// Creates a publisher that gives up after `max_attempts` version races.
    pub fn new(local: SiloAddress, cache: Arc<MembershipTableCache>, max_attempts: usize) -> Self {
        Self {
            local,
            cache,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Publishes one heartbeat stamped `now`.
    ///
    /// # Errors
    ///
    /// [`MembershipError::SelfDeclaredDead`] if the row is Dead,
    /// [`MembershipError::Contention`] if every attempt lost a version race,
    /// or the store error that outlived its retry budget.
    pub async fn publish(&self, now: DateTime<Utc>) -> Result<(), MembershipError> {
        let store = Arc::clone(self.cache.store());
        let retry = self.cache.retry_config().clone();

        for attempt in 1..=self.max_attempts {
            let expected = self.cache.read_version();
            let outcome = with_retry(&retry, "merge_column", || {
                store.merge_column(self.local, ColumnUpdate::IAmAlive(now), &expected)
            })
            .await?;

            match outcome {
                WriteOutcome::Applied { version, row } => {
                    trace!(silo = %self.local, version = version.version, "heartbeat published");
                    self.cache.record_write(&version, row);
                    return Ok(());
                }
                WriteOutcome::VersionConflict { current } => {
                    debug!(silo = %self.local, attempt, current = current.version, "heartbeat lost version race");
                    self.cache.refresh().await?;
                }
                WriteOutcome::RowDead => return Err(MembershipError::SelfDeclaredDead(self.local)),
                WriteOutcome::RowMissing => {
                    return Err(MembershipError::JoinFailed(format!(
                        "no membership row for {}",
                        self.local
                    )));
                }
            }
        }

        Err(MembershipError::Contention {
            operation: "heartbeat",
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::store::memory::InMemoryMembershipTable;
    use crate::store::{InsertOutcome, MembershipTableStore};
    use crate::table::{MembershipEntry, SiloStatus};
    use std::net::SocketAddr;

    async fn setup(column_merge: bool) -> (Arc<InMemoryMembershipTable>, HeartbeatPublisher, SiloAddress) {
        let table = Arc::new(InMemoryMembershipTable::new());
        table.set_column_merge(column_merge);
        let local = SiloAddress::new(SocketAddr::from(([127, 0, 0, 1], 11_111)), 1);
        let entry = MembershipEntry::joining(local, "s", "h", Utc::now());
        assert!(matches!(
            table.insert_row(entry).await.unwrap(),
            InsertOutcome::Inserted { .. }
        ));

        let store: Arc<dyn MembershipTableStore> = table.clone();
        let cache = Arc::new(MembershipTableCache::new(store, RetryConfig::default()));
        cache.refresh().await.unwrap();
        (table, HeartbeatPublisher::new(local, cache, 3), local)
    }

    #[tokio::test]
    async fn heartbeat_advances_alive_time() {
        let (table, publisher, local) = setup(true).await;
        let later = Utc::now() + chrono::Duration::seconds(5);
        publisher.publish(later).await.unwrap();
        assert_eq!(table.row(&local).map(|row| row.i_am_alive_time), Some(later));
    }

    #[tokio::test]
    async fn fallback_path_recovers_from_conflict() {
        let (table, publisher, local) = setup(false).await;

        let mut row = table.row(&local).unwrap();
        row.status = SiloStatus::Active;
        let version = table.version();
        table.update_row(row, &version).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(5);
        publisher.publish(later).await.unwrap();
        let row = table.row(&local).unwrap();
        assert_eq!(row.i_am_alive_time, later);
        assert_eq!(row.status, SiloStatus::Active);
    }

    #[tokio::test]
    async fn dead_row_reports_self_declared_dead() {
        let (table, publisher, local) = setup(true).await;
        let mut row = table.row(&local).unwrap();
        row.status = SiloStatus::Dead;
        let version = table.version();
        table.update_row(row, &version).await.unwrap();

        let err = publisher.publish(Utc::now()).await.unwrap_err();
        assert!(matches!(err, MembershipError::SelfDeclaredDead(silo) if silo == local));
    }
}
