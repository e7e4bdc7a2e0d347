use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MembershipError;

/// Top-level membership configuration shared by the CLI and the core crate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Probe cadence and miss accounting.
    pub probe: ProbeConfig,
    /// Suspicion window and quorum rules.
    pub voting: VotingConfig,
    /// Liveness heartbeat publication.
    pub heartbeat: HeartbeatConfig,
    /// Gossip dissemination of table deltas.
    pub gossip: GossipConfig,
    /// Table refresh cadence and store retry policy.
    pub table: TableConfig,
    /// Join-time validation.
    pub join: JoinConfig,
}

impl MembershipConfig {
    /// Rejects settings that would stall or disable failure detection.
    pub fn validate(&self) -> Result<(), MembershipError> {
        let intervals = [
            ("probe.interval", self.probe.interval),
            ("probe.timeout", self.probe.timeout),
            ("probe.miss_window", self.probe.miss_window),
            ("voting.suspicion_window", self.voting.suspicion_window),
            ("heartbeat.interval", self.heartbeat.interval),
            ("gossip.interval", self.gossip.interval),
            ("table.refresh_interval", self.table.refresh_interval),
            ("table.retry.call_timeout", self.table.retry.call_timeout),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(MembershipError::Configuration(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if self.probe.timeout >= self.probe.interval {
            return Err(MembershipError::Configuration(format!(
                "probe.timeout ({:?}) must be shorter than probe.interval ({:?})",
                self.probe.timeout, self.probe.interval
            )));
        }
        if self.probe.miss_threshold == 0 {
            return Err(MembershipError::Configuration(
                "probe.miss_threshold must be at least 1".to_string(),
            ));
        }
        if !(self.voting.quorum_fraction > 0.0 && self.voting.quorum_fraction <= 1.0) {
            return Err(MembershipError::Configuration(format!(
                "voting.quorum_fraction must be in (0, 1], got {}",
                self.voting.quorum_fraction
            )));
        }
        if self.voting.quorum_floor == 0 {
            return Err(MembershipError::Configuration(
                "voting.quorum_floor must be at least 1".to_string(),
            ));
        }
        if self.gossip.max_batch_entries == 0 {
            return Err(MembershipError::Configuration(
                "gossip.max_batch_entries must be at least 1".to_string(),
            ));
        }
        if self.voting.max_declaration_attempts == 0 || self.table.retry.max_attempts == 0 {
            return Err(MembershipError::Configuration(
                "retry attempt budgets must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Probe tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Interval between probe rounds.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Deadline for a single probe round-trip.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Misses inside `miss_window` that raise local suspicion.
    pub miss_threshold: usize,
    /// Sliding window over which misses are counted.
    #[serde(with = "humantime_serde")]
    pub miss_window: Duration,
    /// Number of ring successors each silo monitors.
    pub probed_silos: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_millis(500),
            miss_threshold: 3,
            miss_window: Duration::from_secs(10),
            probed_silos: 3,
        }
    }
}

/// Suspicion and quorum rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VotingConfig {
    /// Votes older than this (plus skew margin) no longer count.
    #[serde(with = "humantime_serde")]
    pub suspicion_window: Duration,
    /// Fraction of the other Active silos whose votes declare death.
    pub quorum_fraction: f64,
    /// Absolute minimum vote count, capped by the number of possible voters.
    pub quorum_floor: usize,
    /// Maximum expected wall-clock drift between silos.
    #[serde(with = "humantime_serde")]
    pub clock_skew_margin: Duration,
    /// Refresh-and-retry budget for a single vote or declaration.
    pub max_declaration_attempts: usize,
    /// Cap on the suspicion list stored in a row.
    pub max_votes_per_entry: usize,
    /// A voter does not rewrite its own vote more often than this.
    #[serde(with = "humantime_serde")]
    pub vote_refresh_interval: Duration,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            suspicion_window: Duration::from_secs(120),
            quorum_fraction: 0.5,
            quorum_floor: 2,
            clock_skew_margin: Duration::from_secs(5),
            max_declaration_attempts: 3,
            max_votes_per_entry: 32,
            vote_refresh_interval: Duration::from_secs(30),
        }
    }
}

/// Liveness heartbeat settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Period between `iAmAlive` writes.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Heartbeats older than this mark a probed peer as suspect.
    #[serde(with = "humantime_serde")]
    pub staleness_threshold: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            staleness_threshold: Duration::from_secs(60),
        }
    }
}

/// Gossip dissemination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Disables pushes entirely when `false`; correctness does not depend on it.
    pub enabled: bool,
    /// Peers contacted per push.
    pub fanout: usize,
    /// Batching period for pending deltas.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Rows sent per flush, newest first; the rest wait for the next flush.
    pub max_batch_entries: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fanout: 3,
            interval: Duration::from_millis(250),
            max_batch_entries: 16,
        }
    }
}

/// Table refresh and store access settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    /// Period between full table reads.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// Consecutive failed store interactions before health turns degraded.
    pub degraded_after_failures: u32,
    /// Deadline and backoff schedule for store calls.
    pub retry: RetryConfig,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(10),
            degraded_after_failures: 3,
            retry: RetryConfig::default(),
        }
    }
}

/// Bounded exponential backoff for transient store failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Deadline for each individual store call.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Upper bound for the doubled delay.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Total attempts including the first call.
    pub max_attempts: usize,
}

impl RetryConfig {
    /// Single-attempt variant used for best-effort writes during shutdown.
    #[must_use]
    pub fn single_attempt(&self) -> Self {
        Self {
            max_attempts: 1,
            ..self.clone()
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            max_attempts: 4,
        }
    }
}

/// Join-time validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinConfig {
    /// Probe every Active silo once before becoming Active.
    pub validate_initial_connectivity: bool,
}
