use std::fmt;
use std::net::{IpAddr, SocketAddr};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Milliseconds between the Unix epoch and 2020-01-01T00:00:00Z.
const GENERATION_EPOCH_MILLIS: i64 = 1_577_836_800_000;

/// Identity of one silo incarnation: the endpoint it listens on plus a
/// generation that distinguishes restarts on the same endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SiloAddress {
    /// Probe/gossip endpoint.
    pub endpoint: SocketAddr,
    /// Incarnation number, strictly larger on every restart.
    pub generation: i64,
}

impl SiloAddress {
    /// Creates an identity with an explicit generation.
    #[must_use]
    pub const fn new(endpoint: SocketAddr, generation: i64) -> Self {
        Self {
            endpoint,
            generation,
        }
    }

    /// Creates an identity whose generation is derived from the wall clock.
    #[must_use]
    pub fn new_generation(endpoint: SocketAddr) -> Self {
        let generation = Utc::now().timestamp_millis() - GENERATION_EPOCH_MILLIS;
        Self::new(endpoint, generation.max(1))
    }

    /// Returns `true` when both identities refer to the same endpoint.
    #[must_use]
    pub fn same_endpoint(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
    }

    /// Returns `true` when `self` is an earlier incarnation of `other`.
    #[must_use]
    pub fn is_older_generation_of(&self, other: &Self) -> bool {
        self.same_endpoint(other) && self.generation < other.generation
    }

    /// Stable position on the probe ring.
    #[must_use]
    pub fn ring_hash(&self) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

        let ip_bytes: Vec<u8> = match self.endpoint.ip() {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        };
        ip_bytes
            .into_iter()
            .chain(self.endpoint.port().to_be_bytes())
            .chain(self.generation.to_be_bytes())
            .fold(FNV_OFFSET, |hash, byte| {
                let hash = hash ^ u64::from(byte);
                hash.wrapping_mul(FNV_PRIME)
            })
    }
}

impl fmt::Display for SiloAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.endpoint, self.generation)
    }
}
