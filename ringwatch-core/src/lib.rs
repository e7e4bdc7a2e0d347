//! Membership and failure detection for a cluster of silos.
//!
//! Every silo runs a [`MembershipAgent`](agent::MembershipAgent) that announces
//! itself in a shared, versioned membership table, proves liveness through
//! periodic heartbeats, probes a deterministic set of ring successors, and
//! votes on suspected failures. Agreement on a silo's status comes from
//! suspicion votes recorded in the table plus conditional (version-checked)
//! writes; gossip only shortens convergence below the table refresh period.

#![warn(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::unimplemented,
    clippy::todo
)]
#![deny(clippy::unwrap_in_result, clippy::panic_in_result_fn)]

/// Subsystem orchestration: join, heartbeat, probe, vote, gossip, shutdown.
pub mod agent;
/// Local snapshot of the membership table with delta merging.
pub mod cache;
/// Declarative configuration for every periodic task and threshold.
pub mod config;
/// Probe target tracking, miss counting and heartbeat staleness checks.
pub mod detector;
/// Error types surfaced by the membership subsystem.
pub mod error;
/// Best-effort dissemination of table deltas to peers.
pub mod gossip;
/// Periodic `iAmAlive` publication for the local silo.
pub mod heartbeat;
/// Silo identity (endpoint plus generation).
pub mod identity;
/// Ordered startup/shutdown stage registry.
pub mod lifecycle;
/// Table change fan-out and the client gateway list.
pub mod observers;
/// Deterministic ring successor selection.
pub mod ring;
/// Abstract membership table store plus the in-memory binding.
pub mod store;
/// Membership table records, versions and snapshots.
pub mod table;
/// Probe and gossip transports.
pub mod transport;
/// Suspicion vote aggregation and death declaration.
pub mod voting;

pub use agent::{LocalSiloDetails, MembershipAgent, MembershipHealth, ShutdownMode};
pub use cache::{ChangeOrigin, DeltaOutcome, MembershipTableCache, TableChange};
pub use config::MembershipConfig;
pub use detector::{FailureDetector, ProbeObserver, ProbeOutcome, SuspicionEvent, SuspicionReason};
pub use error::{MembershipError, StoreError, TransportError};
pub use gossip::GossipDisseminator;
pub use heartbeat::HeartbeatPublisher;
pub use identity::SiloAddress;
pub use lifecycle::{LifecycleRegistry, add_startup_task, stages};
pub use observers::{GatewayEntry, GatewayListProvider, MembershipObserver, ObserverRegistry};
pub use store::memory::InMemoryMembershipTable;
pub use store::{
    ColumnUpdate, InsertOutcome, MembershipTableStore, TableReadout, WriteOutcome,
};
pub use table::{
    MembershipEntry, MembershipTableSnapshot, SiloStatus, SuspectVote, TableDelta, TableVersion,
};
pub use transport::local::{LocalNetwork, LocalTransport};
pub use transport::udp::UdpTransport;
pub use transport::{MembershipMessage, MembershipMessageHandler, MembershipTransport, ProbeReply};
pub use voting::{IgnoreReason, SuspicionEngine, VoteOutcome, required_votes};
