use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MembershipError;
use crate::identity::SiloAddress;

/// Status recorded for a silo in the membership table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiloStatus {
    /// Row inserted, silo still validating its place in the cluster.
    Joining,
    /// Fully participating; eligible as a gateway.
    Active,
    /// Graceful shutdown has begun.
    ShuttingDown,
    /// Stopping its hosted workload.
    Stopping,
    /// About to leave the cluster.
    Leaving,
    /// Terminal. The row is never written again.
    Dead,
}

impl SiloStatus {
    /// Position in the forward-only status order.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Joining => 0,
            Self::Active => 1,
            Self::ShuttingDown => 2,
            Self::Stopping => 3,
            Self::Leaving => 4,
            Self::Dead => 5,
        }
    }

    /// Returns `true` for `Dead`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Dead)
    }

    /// Silos in these states are probed by their ring predecessors.
    #[must_use]
    pub const fn is_monitored(self) -> bool {
        matches!(self, Self::Active | Self::ShuttingDown | Self::Stopping)
    }

    /// Returns `true` when moving to `next` is a legal forward transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for SiloStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Joining => "joining",
            Self::Active => "active",
            Self::ShuttingDown => "shutting_down",
            Self::Stopping => "stopping",
            Self::Leaving => "leaving",
            Self::Dead => "dead",
        };
        f.write_str(label)
    }
}

/// A peer's timestamped assertion that a silo is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspectVote {
    /// Silo that cast the vote.
    pub voter: SiloAddress,
    /// Voter's wall-clock time when the vote was cast.
    pub at: DateTime<Utc>,
}

/// One row of the membership table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEntry {
    /// Row key.
    pub silo: SiloAddress,
    /// Current status.
    pub status: SiloStatus,
    /// Human-readable silo name.
    pub silo_name: String,
    /// Host the silo runs on.
    pub host_name: String,
    /// Client gateway port, when the silo accepts client connections.
    pub proxy_port: Option<u16>,
    /// Optional role label used by client-side selection.
    pub role: Option<String>,
    /// When the silo joined.
    pub start_time: DateTime<Utc>,
    /// Last self-reported heartbeat.
    pub i_am_alive_time: DateTime<Utc>,
    /// Suspicion votes, oldest first, at most one per voter.
    pub suspect_times: Vec<SuspectVote>,
    /// Table version at which the store last wrote this row.
    pub row_version: u64,
}

impl MembershipEntry {
    /// Builds the `Joining` row a silo inserts for itself at startup.
    #[must_use]
    pub fn joining(
        silo: SiloAddress,
        silo_name: impl Into<String>,
        host_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            silo,
            status: SiloStatus::Joining,
            silo_name: silo_name.into(),
            host_name: host_name.into(),
            proxy_port: None,
            role: None,
            start_time: now,
            i_am_alive_time: now,
            suspect_times: Vec::new(),
            row_version: 0,
        }
    }

    /// Sets the gateway port.
    #[must_use]
    pub const fn with_proxy_port(mut self, port: u16) -> Self {
        self.proxy_port = Some(port);
        self
    }

    /// Sets the role label.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Client-facing endpoint, present only for silos exposing a proxy port.
    #[must_use]
    pub fn gateway_endpoint(&self) -> Option<SocketAddr> {
        self.proxy_port
            .map(|port| SocketAddr::new(self.silo.endpoint.ip(), port))
    }

    /// Records a vote, keeping one slot per voter and at most `cap` votes.
    ///
    /// Returns `false` when the voter already holds an equal or newer vote.
    pub fn record_vote(&mut self, vote: SuspectVote, cap: usize) -> bool {
        if let Some(existing) = self
            .suspect_times
            .iter_mut()
            .find(|existing| existing.voter == vote.voter)
        {
            if existing.at >= vote.at {
                return false;
            }
            existing.at = vote.at;
        } else {
            self.suspect_times.push(vote);
        }

        self.suspect_times.sort_by_key(|v| (v.at, v.voter));
        let cap = cap.max(1);
        if self.suspect_times.len() > cap {
            let excess = self.suspect_times.len() - cap;
            self.suspect_times.drain(..excess);
        }
        true
    }

    /// Drops votes cast before `cutoff`. Returns `true` if any were removed.
    pub fn prune_votes(&mut self, cutoff: DateTime<Utc>) -> bool {
        let before = self.suspect_times.len();
        self.suspect_times.retain(|vote| vote.at >= cutoff);
        self.suspect_times.len() != before
    }

    /// Distinct voters whose votes were cast at or after `cutoff`.
    #[must_use]
    pub fn fresh_voters(&self, cutoff: DateTime<Utc>) -> BTreeSet<SiloAddress> {
        self.suspect_times
            .iter()
            .filter(|vote| vote.at >= cutoff)
            .map(|vote| vote.voter)
            .collect()
    }

    /// Vote currently held by `voter`, if any.
    #[must_use]
    pub fn vote_of(&self, voter: &SiloAddress) -> Option<&SuspectVote> {
        self.suspect_times.iter().find(|vote| &vote.voter == voter)
    }

    /// Moves the row forward to `next`; re-applying the current status is a no-op.
    pub fn set_status(&mut self, next: SiloStatus) -> Result<(), MembershipError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(MembershipError::InvalidTransition {
                silo: self.silo,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    fn precedence(&self) -> (bool, u64) {
        (self.status.is_terminal(), self.row_version)
    }
}

/// Table-wide version plus the opaque concurrency token the store issued with it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableVersion {
    /// Strictly increasing mutation counter.
    pub version: u64,
    /// Opaque token accompanying `version`.
    pub etag: String,
}

impl TableVersion {
    /// Version of an empty table.
    #[must_use]
    pub fn initial() -> Self {
        Self {
            version: 0,
            etag: String::from("0"),
        }
    }

    /// Successor version with a fresh etag.
    #[must_use]
    pub fn next(&self) -> Self {
        Self {
            version: self.version + 1,
            etag: Uuid::new_v4().to_string(),
        }
    }
}

impl fmt::Display for TableVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.version)
    }
}

/// Changed rows pushed between silos, tagged with the sender's table version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDelta {
    /// Sender's table version when the delta was assembled.
    pub version: TableVersion,
    /// Rows that changed.
    pub entries: Vec<MembershipEntry>,
}

/// Immutable view of the membership table as last observed by one silo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipTableSnapshot {
    /// Table version this snapshot reflects.
    pub version: TableVersion,
    read_version: TableVersion,
    entries: BTreeMap<SiloAddress, MembershipEntry>,
}

impl Default for MembershipTableSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl MembershipTableSnapshot {
    /// Snapshot of an empty table.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            version: TableVersion::initial(),
            read_version: TableVersion::initial(),
            entries: BTreeMap::new(),
        }
    }

    /// Builds a snapshot from a full table readout.
    #[must_use]
    pub fn new(version: TableVersion, entries: impl IntoIterator<Item = MembershipEntry>) -> Self {
        Self {
            read_version: version.clone(),
            version,
            entries: entries
                .into_iter()
                .map(|entry| (entry.silo, entry))
                .collect(),
        }
    }

    /// Latest version at which this snapshot is known to hold every row.
    ///
    /// Gossip can raise [`version`](Self::version) past rows this silo never
    /// saw, so conditional writes built from cached rows expect this version
    /// instead.
    #[must_use]
    pub const fn read_version(&self) -> &TableVersion {
        &self.read_version
    }

    /// Marks the snapshot complete at `version` unless it already is at a
    /// later one.
    pub fn mark_read(&mut self, version: &TableVersion) {
        if version.version > self.read_version.version {
            self.read_version = version.clone();
        }
    }

    /// Row for `silo`, if present.
    #[must_use]
    pub fn get(&self, silo: &SiloAddress) -> Option<&MembershipEntry> {
        self.entries.get(silo)
    }

    /// All rows ordered by identity.
    pub fn entries(&self) -> impl Iterator<Item = &MembershipEntry> {
        self.entries.values()
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when the snapshot holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Identities of Active silos.
    #[must_use]
    pub fn active_silos(&self) -> Vec<SiloAddress> {
        self.entries
            .values()
            .filter(|entry| entry.status == SiloStatus::Active)
            .map(|entry| entry.silo)
            .collect()
    }

    /// Active silos other than `excluded`.
    #[must_use]
    pub fn count_active_excluding(&self, excluded: &SiloAddress) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.status == SiloStatus::Active && &entry.silo != excluded)
            .count()
    }

    /// Silos that should be probed by someone.
    #[must_use]
    pub fn monitored_silos(&self) -> Vec<SiloAddress> {
        self.entries
            .values()
            .filter(|entry| entry.status.is_monitored())
            .map(|entry| entry.silo)
            .collect()
    }

    /// Joins `incoming` rows into a new snapshot.
    ///
    /// A row replaces the cached one only if it is Dead while the cached one is
    /// not, or if both agree on deadness and its `row_version` is newer. The
    /// resulting version is the larger of the two; the read version is kept.
    /// Returns the new snapshot and the rows that actually changed.
    #[must_use]
    pub fn merge(
        &self,
        version: &TableVersion,
        incoming: impl IntoIterator<Item = MembershipEntry>,
    ) -> (Self, Vec<MembershipEntry>) {
        let mut entries = self.entries.clone();
        let mut changed = Vec::new();

        for entry in incoming {
            let replace = entries
                .get(&entry.silo)
                .is_none_or(|current| entry.precedence() > current.precedence());
            if replace {
                changed.push(entry.clone());
                entries.insert(entry.silo, entry);
            }
        }

        let version = if version.version > self.version.version {
            version.clone()
        } else {
            self.version.clone()
        };
        (
            Self {
                version,
                read_version: self.read_version.clone(),
                entries,
            },
            changed,
        )
    }

    /// Rows written after table version `since`.
    #[must_use]
    pub fn changed_since(&self, since: u64) -> Vec<MembershipEntry> {
        self.entries
            .values()
            .filter(|entry| entry.row_version > since)
            .cloned()
            .collect()
    }

    /// Packages the whole snapshot as a delta.
    #[must_use]
    pub fn to_delta(&self) -> TableDelta {
        TableDelta {
            version: self.version.clone(),
            entries: self.entries.values().cloned().collect(),
        }
    }
}
