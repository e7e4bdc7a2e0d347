//! Store contract for the shared membership table.
//!
//! Every mutation is conditional on the table-wide [`TableVersion`]. A rejected
//! write reports the store's current version so the caller can refresh and
//! retry; it is never an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::identity::SiloAddress;
use crate::table::{MembershipEntry, SuspectVote, TableVersion};

pub mod memory;
pub mod retry;

/// Narrow per-row update that avoids rewriting unrelated fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnUpdate {
    /// Refresh the row's `i_am_alive_time`.
    IAmAlive(DateTime<Utc>),
    /// Append (or refresh) one suspicion vote.
    SuspectVote {
        /// Vote to record.
        vote: SuspectVote,
        /// Votes cast before this instant are pruned first.
        cutoff: DateTime<Utc>,
        /// Cap on the stored vote list.
        max_votes: usize,
    },
}

impl ColumnUpdate {
    /// Applies the column change to a decoded row.
    pub fn apply(&self, entry: &mut MembershipEntry) {
        match self {
            Self::IAmAlive(at) => {
                if *at > entry.i_am_alive_time {
                    entry.i_am_alive_time = *at;
                }
            }
            Self::SuspectVote {
                vote,
                cutoff,
                max_votes,
            } => {
                entry.prune_votes(*cutoff);
                entry.record_vote(*vote, *max_votes);
            }
        }
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write landed; `row` is what the store now holds.
    Applied {
        /// Table version produced by this write.
        version: TableVersion,
        /// Row as written, with its `row_version` set.
        row: MembershipEntry,
    },
    /// The expected version was stale.
    VersionConflict {
        /// Version the store currently holds.
        current: TableVersion,
    },
    /// No row exists for the silo.
    RowMissing,
    /// The row is Dead and can no longer change.
    RowDead,
}

impl WriteOutcome {
    /// Returns `true` for [`WriteOutcome::Applied`].
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Result of an insert-if-absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The row was created.
    Inserted {
        /// Table version produced by the insert.
        version: TableVersion,
        /// Row as written.
        row: MembershipEntry,
    },
    /// A row for the identity already exists; a benign race.
    AlreadyExists,
}

/// A stored row that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptRecord {
    /// Store-specific key of the offending row.
    pub key: String,
    /// Decoder error.
    pub reason: String,
}

/// Full table read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReadout {
    /// Table version at read time.
    pub version: TableVersion,
    /// Rows that decoded successfully.
    pub entries: Vec<MembershipEntry>,
    /// Rows that were skipped.
    pub corrupt: Vec<CorruptRecord>,
}

/// Durable table shared by every silo of a cluster.
#[async_trait]
pub trait MembershipTableStore: Send + Sync {
    /// Reads every row together with the current table version.
    async fn read_all(&self) -> Result<TableReadout, StoreError>;

    /// Inserts `entry` unless a row for its identity exists.
    async fn insert_row(&self, entry: MembershipEntry) -> Result<InsertOutcome, StoreError>;

    /// Replaces the row for `entry.silo` if the table is still at `expected`.
    async fn update_row(
        &self,
        entry: MembershipEntry,
        expected: &TableVersion,
    ) -> Result<WriteOutcome, StoreError>;

    /// Whether [`merge_column`](Self::merge_column) is handled natively.
    fn supports_column_merge(&self) -> bool {
        false
    }

    /// Applies a single column change to the row for `silo`.
    ///
    /// The default implementation reads the row and performs a full
    /// conditional [`update_row`](Self::update_row).
    async fn merge_column(
        &self,
        silo: SiloAddress,
        column: ColumnUpdate,
        expected: &TableVersion,
    ) -> Result<WriteOutcome, StoreError> {
        merge_column_via_update(self, silo, column, expected).await
    }
}

/// Column merge expressed as read-row plus conditional full-row update.
pub async fn merge_column_via_update<S>(
    store: &S,
    silo: SiloAddress,
    column: ColumnUpdate,
    expected: &TableVersion,
) -> Result<WriteOutcome, StoreError>
where
    S: MembershipTableStore + ?Sized,
{
    let readout = store.read_all().await?;
    if readout.version.version != expected.version {
        return Ok(WriteOutcome::VersionConflict {
            current: readout.version,
        });
    }

    let Some(mut row) = readout.entries.into_iter().find(|entry| entry.silo == silo) else {
        return Ok(WriteOutcome::RowMissing);
    };
    if row.status.is_terminal() {
        return Ok(WriteOutcome::RowDead);
    }

    column.apply(&mut row);
    store.update_row(row, &readout.version).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn silo(port: u16) -> SiloAddress {
        SiloAddress::new(SocketAddr::from(([127, 0, 0, 1], port)), 1)
    }

    #[test]
    fn heartbeat_column_never_moves_backwards() {
        let now = Utc::now();
        let mut row = MembershipEntry::joining(silo(1), "a", "host", now);
        ColumnUpdate::IAmAlive(now - chrono::Duration::seconds(30)).apply(&mut row);
        assert_eq!(row.i_am_alive_time, now);
        ColumnUpdate::IAmAlive(now + chrono::Duration::seconds(30)).apply(&mut row);
        assert_eq!(row.i_am_alive_time, now + chrono::Duration::seconds(30));
    }

    #[test]
    fn vote_column_prunes_before_recording() {
        let now = Utc::now();
        let mut row = MembershipEntry::joining(silo(1), "a", "host", now);
        row.record_vote(
            SuspectVote {
                voter: silo(2),
                at: now - chrono::Duration::minutes(10),
            },
            8,
        );

        ColumnUpdate::SuspectVote {
            vote: SuspectVote {
                voter: silo(3),
                at: now,
            },
            cutoff: now - chrono::Duration::minutes(2),
            max_votes: 8,
        }
        .apply(&mut row);

        assert_eq!(row.suspect_times.len(), 1);
        assert!(row.vote_of(&silo(3)).is_some());
    }
}
