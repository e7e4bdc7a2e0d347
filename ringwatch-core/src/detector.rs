use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::MembershipConfig;
use crate::identity::SiloAddress;
use crate::ring;
use crate::table::MembershipTableSnapshot;

/// Result of one probe round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The target answered.
    Ack {
        /// Identity that answered.
        responder: SiloAddress,
        /// Round-trip time.
        latency: Duration,
    },
    /// No answer before the probe deadline.
    Timeout,
    /// The probe could not be delivered or was rejected.
    Refused(String),
    /// A different incarnation answered on the target's endpoint.
    WrongGeneration {
        /// Identity that answered instead.
        responder: SiloAddress,
    },
}

impl ProbeOutcome {
    /// Returns `true` only for an acknowledgement from the probed identity.
    #[must_use]
    pub fn is_ack_from(&self, target: &SiloAddress) -> bool {
        matches!(self, Self::Ack { responder, .. } if responder == target)
    }
}

/// Why a silo is suspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspicionReason {
    /// Too many probe misses inside the miss window.
    MissedProbes {
        /// Misses counted in the window.
        misses: usize,
    },
    /// The target's own heartbeat has not advanced.
    StaleHeartbeat {
        /// Age of the last heartbeat.
        age: Duration,
    },
}

/// Local suspicion raised by the detector; turned into a vote by the voting engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuspicionEvent {
    /// Suspected silo.
    pub target: SiloAddress,
    /// Evidence.
    pub reason: SuspicionReason,
    /// Wall-clock time of the observation.
    pub observed_at: DateTime<Utc>,
}

/// Observer hook for probe telemetry.
pub trait ProbeObserver: Send + Sync {
    /// Records the round-trip time of a successful probe.
    fn record_probe_latency(&self, target: SiloAddress, latency: Duration);

    /// Called for every suspicion the detector raises.
    fn record_suspicion(&self, _event: &SuspicionEvent) {}
}

/// Tracks the probe set and turns probe results into suspicion events.
pub struct FailureDetector {
    local: SiloAddress,
    probed_silos: usize,
    miss_threshold: usize,
    miss_window: Duration,
    staleness: Duration,
    targets: RwLock<Vec<SiloAddress>>,
    misses: DashMap<SiloAddress, VecDeque<Instant>>,
    observer: Option<Arc<dyn ProbeObserver>>,
}

impl FailureDetector {
    /// Creates a detector with an empty probe set.
    pub fn new(local: SiloAddress, config: &MembershipConfig) -> Self {
        Self {
            local,
            probed_silos: config.probe.probed_silos,
            miss_threshold: config.probe.miss_threshold.max(1),
            miss_window: config.probe.miss_window,
            staleness: config.heartbeat.staleness_threshold + config.voting.clock_skew_margin,
            targets: RwLock::new(Vec::new()),
            misses: DashMap::new(),
            observer: None,
        }
    }

    /// Attaches a telemetry observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ProbeObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Recomputes the probe set from `snapshot` and forgets misses of dropped targets.
    pub fn update_targets(&self, snapshot: &MembershipTableSnapshot) -> Vec<SiloAddress> {
        let next = ring::successors(snapshot, &self.local, self.probed_silos);
        let mut targets = self.targets.write();
        if *targets != next {
            debug!(silo = %self.local, targets = ?next, "probe set changed");
            self.misses.retain(|silo, _| next.contains(silo));
            targets.clone_from(&next);
        }
        next
    }

    /// Current probe set.
    pub fn targets(&self) -> Vec<SiloAddress> {
        self.targets.read().clone()
    }

    /// Removes `silo` from the probe set immediately.
    pub fn evict(&self, silo: &SiloAddress) {
        self.targets.write().retain(|target| target != silo);
        self.misses.remove(silo);
    }

    /// Records a probe result; returns a suspicion once misses in the window
    /// reach the threshold.
    pub fn record_probe(
        &self,
        target: SiloAddress,
        outcome: &ProbeOutcome,
        now: Instant,
    ) -> Option<SuspicionEvent> {
        if outcome.is_ack_from(&target) {
            self.misses.remove(&target);
            if let (Some(observer), ProbeOutcome::Ack { latency, .. }) = (&self.observer, outcome) {
                observer.record_probe_latency(target, *latency);
            }
            trace!(%target, "probe acknowledged");
            return None;
        }

        let misses = {
            let mut window = self.misses.entry(target).or_default();
            window.push_back(now);
            if let Some(horizon) = now.checked_sub(self.miss_window) {
                while window.front().is_some_and(|at| *at < horizon) {
                    window.pop_front();
                }
            }
            window.len()
        };
        debug!(%target, ?outcome, misses, "probe missed");

        if misses < self.miss_threshold {
            return None;
        }
        let event = SuspicionEvent {
            target,
            reason: SuspicionReason::MissedProbes { misses },
            observed_at: Utc::now(),
        };
        if let Some(observer) = &self.observer {
            observer.record_suspicion(&event);
        }
        Some(event)
    }

    /// Misses currently counted for `target`.
    pub fn miss_count(&self, target: &SiloAddress) -> usize {
        self.misses.get(target).map_or(0, |window| window.len())
    }

    /// Probe targets whose heartbeat is older than the staleness threshold
    /// plus the clock-skew margin.
    pub fn stale_targets(
        &self,
        snapshot: &MembershipTableSnapshot,
        now: DateTime<Utc>,
    ) -> Vec<SuspicionEvent> {
        self.targets
            .read()
            .iter()
            .filter_map(|target| {
                let entry = snapshot.get(target)?;
                let age = (now - entry.i_am_alive_time).to_std().ok()?;
                (age > self.staleness).then_some(SuspicionEvent {
                    target: *target,
                    reason: SuspicionReason::StaleHeartbeat { age },
                    observed_at: now,
                })
            })
            .collect()
    }
}
