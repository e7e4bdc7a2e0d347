use std::time::Duration;

use thiserror::Error;

use crate::identity::SiloAddress;
use crate::table::SiloStatus;

/// Failures raised by a membership table store binding.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Transient connectivity failure; callers retry with backoff.
    #[error("membership table unavailable: {0}")]
    Unavailable(String),
    /// A store call exceeded its deadline.
    #[error("membership table call timed out after {0:?}")]
    Timeout(Duration),
    /// The table could not be parsed as a whole. Never retried.
    #[error("membership table corrupt: {0}")]
    Corrupt(String),
    /// A row could not be encoded for storage.
    #[error("membership row encoding failed: {0}")]
    Encoding(String),
}

impl StoreError {
    /// Returns `true` for failures worth retrying against the same store.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Failures raised while exchanging probes or gossip with peers.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying network I/O failure.
    #[error("membership transport error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization or deserialization failure for a wire message.
    #[error("membership serialization error: {0}")]
    Serialization(String),
    /// Payload exceeded the configured packet budget.
    #[error("membership message too large: {0} bytes")]
    MessageTooLarge(usize),
    /// No listener is registered for the target silo.
    #[error("silo {0} is unreachable")]
    Unreachable(SiloAddress),
    /// The transport was shut down while a request was outstanding.
    #[error("membership transport closed")]
    Closed,
}

/// Errors surfaced by the membership subsystem.
#[derive(Debug, Error)]
pub enum MembershipError {
    /// Store failure that outlived the retry budget, or a fatal store error.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Transport failure (bind, send, receive).
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Invalid configuration detected at construction time.
    #[error("membership configuration error: {0}")]
    Configuration(String),
    /// Own-row writes kept losing the version race.
    #[error("{operation} lost {attempts} consecutive version races")]
    Contention {
        /// Name of the contended operation.
        operation: &'static str,
        /// Attempts made before giving up.
        attempts: usize,
    },
    /// A newer generation of this endpoint is already live in the table.
    #[error("silo {local} superseded by newer generation {newer}")]
    SupersededGeneration {
        /// Identity of the local silo.
        local: SiloAddress,
        /// Live identity with the same endpoint and a newer generation.
        newer: SiloAddress,
    },
    /// The cluster declared the local silo dead.
    #[error("silo {0} has been declared dead by the cluster")]
    SelfDeclaredDead(SiloAddress),
    /// The local silo could not enter the table.
    #[error("silo failed to join the cluster: {0}")]
    JoinFailed(String),
    /// Startup connectivity check found unreachable Active silos.
    #[error("initial connectivity check failed; unreachable silos: {unreachable:?}")]
    InitialConnectivity {
        /// Active silos that did not answer a probe.
        unreachable: Vec<SiloAddress>,
    },
    /// Attempted a status change the state machine does not allow.
    #[error("silo {silo} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Silo whose row was being changed.
        silo: SiloAddress,
        /// Status currently recorded.
        from: SiloStatus,
        /// Requested status.
        to: SiloStatus,
    },
    /// A lifecycle stage callback failed or was cancelled.
    #[error("lifecycle stage {stage} failed: {reason}")]
    Lifecycle {
        /// Numeric stage that failed.
        stage: i32,
        /// Human-readable failure description.
        reason: String,
    },
}
