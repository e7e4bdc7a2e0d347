use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time;
use tracing::trace;

use super::{
    ColumnUpdate, CorruptRecord, InsertOutcome, MembershipTableStore, TableReadout, WriteOutcome,
};
use crate::error::StoreError;
use crate::identity::SiloAddress;
use crate::table::{MembershipEntry, TableVersion};

#[derive(Debug)]
struct TableState {
    version: TableVersion,
    rows: BTreeMap<SiloAddress, Vec<u8>>,
}

/// In-process membership table for tests and simulations.
///
/// Rows are kept bincode-encoded so that corruption can be injected per row.
/// Fault injection covers unavailability, added latency and toggling native
/// column merges.
#[derive(Debug)]
pub struct InMemoryMembershipTable {
    state: Mutex<TableState>,
    available: AtomicBool,
    column_merge: AtomicBool,
    latency: Mutex<Duration>,
}

impl Default for InMemoryMembershipTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMembershipTable {
    /// Empty, available table with native column merges enabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                version: TableVersion::initial(),
                rows: BTreeMap::new(),
            }),
            available: AtomicBool::new(true),
            column_merge: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// Makes every call fail with [`StoreError::Unavailable`] while `false`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delays every call by `latency` before it touches the table.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Switches between native column merges and the full-row fallback.
    pub fn set_column_merge(&self, enabled: bool) {
        self.column_merge.store(enabled, Ordering::SeqCst);
    }

    /// Overwrites the stored bytes of `silo` with garbage.
    pub fn corrupt_row(&self, silo: &SiloAddress) {
        if let Some(bytes) = self.state.lock().rows.get_mut(silo) {
            *bytes = vec![0xff, 0x00, 0xff];
        }
    }

    /// Current table version.
    #[must_use]
    pub fn version(&self) -> TableVersion {
        self.state.lock().version.clone()
    }

    /// Decoded row for `silo`, if present and readable.
    #[must_use]
    pub fn row(&self, silo: &SiloAddress) -> Option<MembershipEntry> {
        self.state
            .lock()
            .rows
            .get(silo)
            .and_then(|bytes| decode(bytes).ok())
    }

    async fn enter(&self) -> Result<(), StoreError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            time::sleep(latency).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory table offline".to_string()))
        }
    }
}

impl TableState {
    fn write(
        &mut self,
        mut row: MembershipEntry,
    ) -> Result<(TableVersion, MembershipEntry), StoreError> {
        let version = self.version.next();
        row.row_version = version.version;
        let bytes = encode(&row)?;
        self.rows.insert(row.silo, bytes);
        self.version = version.clone();
        trace!(silo = %row.silo, status = %row.status, version = version.version, "row written");
        Ok((version, row))
    }

    fn is_dead(&self, silo: &SiloAddress) -> bool {
        self.rows
            .get(silo)
            .and_then(|bytes| decode(bytes).ok())
            .is_some_and(|row| row.status.is_terminal())
    }
}

#[async_trait]
impl MembershipTableStore for InMemoryMembershipTable {
    async fn read_all(&self) -> Result<TableReadout, StoreError> {
        self.enter().await?;
        let state = self.state.lock();
        let mut entries = Vec::with_capacity(state.rows.len());
        let mut corrupt = Vec::new();
        for (silo, bytes) in &state.rows {
            match decode(bytes) {
                Ok(entry) => entries.push(entry),
                Err(err) => corrupt.push(CorruptRecord {
                    key: silo.to_string(),
                    reason: err.to_string(),
                }),
            }
        }
        Ok(TableReadout {
            version: state.version.clone(),
            entries,
            corrupt,
        })
    }

    async fn insert_row(&self, entry: MembershipEntry) -> Result<InsertOutcome, StoreError> {
        self.enter().await?;
        let mut state = self.state.lock();
        if state.rows.contains_key(&entry.silo) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        let (version, row) = state.write(entry)?;
        Ok(InsertOutcome::Inserted { version, row })
    }

    async fn update_row(
        &self,
        entry: MembershipEntry,
        expected: &TableVersion,
    ) -> Result<WriteOutcome, StoreError> {
        self.enter().await?;
        let mut state = self.state.lock();
        if state.version.version != expected.version {
            return Ok(WriteOutcome::VersionConflict {
                current: state.version.clone(),
            });
        }
        if !state.rows.contains_key(&entry.silo) {
            return Ok(WriteOutcome::RowMissing);
        }
        if state.is_dead(&entry.silo) {
            return Ok(WriteOutcome::RowDead);
        }
        let (version, row) = state.write(entry)?;
        Ok(WriteOutcome::Applied { version, row })
    }

    fn supports_column_merge(&self) -> bool {
        self.column_merge.load(Ordering::SeqCst)
    }

    async fn merge_column(
        &self,
        silo: SiloAddress,
        column: ColumnUpdate,
        expected: &TableVersion,
    ) -> Result<WriteOutcome, StoreError> {
        if !self.supports_column_merge() {
            return super::merge_column_via_update(self, silo, column, expected).await;
        }

        self.enter().await?;
        let mut state = self.state.lock();
        let Some(bytes) = state.rows.get(&silo) else {
            return Ok(WriteOutcome::RowMissing);
        };
        let mut row = decode(bytes)?;
        if row.status.is_terminal() {
            return Ok(WriteOutcome::RowDead);
        }
        column.apply(&mut row);
        let (version, row) = state.write(row)?;
        Ok(WriteOutcome::Applied { version, row })
    }
}

fn encode(entry: &MembershipEntry) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(entry).map_err(|err| StoreError::Encoding(err.to_string()))
}

fn decode(bytes: &[u8]) -> Result<MembershipEntry, StoreError> {
    bincode::deserialize(bytes).map_err(|err| StoreError::Corrupt(err.to_string()))
}
