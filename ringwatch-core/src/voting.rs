use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::cache::MembershipTableCache;
use crate::config::VotingConfig;
use crate::detector::SuspicionEvent;
use crate::error::MembershipError;
use crate::identity::SiloAddress;
use crate::store::retry::with_retry;
use crate::store::{ColumnUpdate, WriteOutcome};
use crate::table::{MembershipEntry, SiloStatus, SuspectVote, TableVersion};

/// Votes needed to declare a silo dead when `active_others` Active silos
/// other than the target could vote.
///
/// The proportional share is raised to `quorum_floor` but never above the
/// number of possible voters, so a two-silo cluster can still make progress.
#[must_use]
pub fn required_votes(active_others: usize, config: &VotingConfig) -> usize {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let proportional = (config.quorum_fraction * active_others as f64).ceil() as usize;
    config
        .quorum_floor
        .max(proportional)
        .min(active_others.max(1))
}

/// Why a suspicion produced no vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// A silo never votes against itself.
    SelfSuspicion,
    /// The target has no row in the cached table.
    UnknownSilo,
    /// The target is not in a monitored status (for example Joining).
    NotMonitored,
}

/// Result of handling one suspicion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Our vote was written; quorum not reached yet.
    Recorded {
        /// Fresh distinct voters after the write.
        votes: usize,
        /// Votes required for a declaration.
        required: usize,
    },
    /// Our existing vote is recent enough; nothing written.
    Unchanged {
        /// Fresh distinct voters including ours.
        votes: usize,
        /// Votes required for a declaration.
        required: usize,
    },
    /// This silo wrote the Dead transition.
    DeclaredDead,
    /// The target was already Dead.
    AlreadyDead,
    /// No vote was cast.
    Ignored(IgnoreReason),
    /// Every attempt lost a version race; retried on the next detection cycle.
    Deferred {
        /// Attempts made.
        attempts: usize,
    },
}

/// Turns local suspicions into table votes and Dead declarations.
pub struct SuspicionEngine {
    local: SiloAddress,
    config: VotingConfig,
    cache: Arc<MembershipTableCache>,
}

impl SuspicionEngine {
    /// Creates an engine voting as `local`.
    pub const fn new(
        local: SiloAddress,
        config: VotingConfig,
        cache: Arc<MembershipTableCache>,
    ) -> Self {
        Self {
            local,
            config,
            cache,
        }
    }

    /// Records a vote for `event.target`, declaring it Dead once enough fresh
    /// distinct voters agree.
    ///
    /// # Errors
    ///
    /// Returns a store error once the store retry budget is exhausted. Version
    /// conflicts are retried up to `max_declaration_attempts` times and then
    /// reported as [`VoteOutcome::Deferred`].
    pub async fn handle_suspicion(
        &self,
        event: &SuspicionEvent,
    ) -> Result<VoteOutcome, MembershipError> {
        let target = event.target;
        if target == self.local {
            debug!(silo = %self.local, "ignoring suspicion of self");
            return Ok(VoteOutcome::Ignored(IgnoreReason::SelfSuspicion));
        }

        let window = TimeDelta::from_std(self.config.suspicion_window + self.config.clock_skew_margin)
            .unwrap_or(TimeDelta::MAX);
        let refresh = TimeDelta::from_std(self.config.vote_refresh_interval).unwrap_or(TimeDelta::MAX);
        let store = Arc::clone(self.cache.store());
        let retry = self.cache.retry_config().clone();
        let attempts = self.config.max_declaration_attempts.max(1);

        let mut conflicts = 0;
        // Row and version the store returned for a vote that completed quorum.
        let mut quorum_row: Option<(MembershipEntry, TableVersion, usize)> = None;

        loop {
            let now = Utc::now();
            let cutoff = now.checked_sub_signed(window).unwrap_or(now);

            let (outcome, required) = if let Some((mut row, expected, required)) = quorum_row.take() {
                row.set_status(SiloStatus::Dead)?;
                let outcome = with_retry(&retry, "update_row", || {
                    store.update_row(row.clone(), &expected)
                })
                .await?;
                (outcome, required)
            } else {
                let snapshot = self.cache.current();
                let Some(entry) = snapshot.get(&target) else {
                    return Ok(VoteOutcome::Ignored(IgnoreReason::UnknownSilo));
                };
                if entry.status.is_terminal() {
                    return Ok(VoteOutcome::AlreadyDead);
                }
                if !entry.status.is_monitored() {
                    return Ok(VoteOutcome::Ignored(IgnoreReason::NotMonitored));
                }

                let mut voters = entry.fresh_voters(cutoff);
                voters.insert(self.local);
                let required = required_votes(snapshot.count_active_excluding(&target), &self.config);
                let vote = SuspectVote {
                    voter: self.local,
                    at: now,
                };
                let expected = snapshot.read_version().clone();

                let outcome = if voters.len() >= required {
                    let mut row = entry.clone();
                    row.prune_votes(cutoff);
                    row.record_vote(vote, self.config.max_votes_per_entry);
                    row.set_status(SiloStatus::Dead)?;
                    with_retry(&retry, "update_row", || {
                        store.update_row(row.clone(), &expected)
                    })
                    .await?
                } else {
                    if let Some(existing) = entry.vote_of(&self.local)
                        && now - existing.at < refresh
                    {
                        return Ok(VoteOutcome::Unchanged {
                            votes: voters.len(),
                            required,
                        });
                    }
                    let column = ColumnUpdate::SuspectVote {
                        vote,
                        cutoff,
                        max_votes: self.config.max_votes_per_entry,
                    };
                    with_retry(&retry, "merge_column", || {
                        store.merge_column(target, column.clone(), &expected)
                    })
                    .await?
                };
                (outcome, required)
            };

            match outcome {
                WriteOutcome::Applied { version, row } => {
                    let declared = row.status.is_terminal();
                    let votes = row.fresh_voters(cutoff).len();
                    self.cache.record_write(&version, row.clone());
                    if declared {
                        info!(%target, voter = %self.local, version = version.version, "silo declared dead");
                        return Ok(VoteOutcome::DeclaredDead);
                    }
                    debug!(%target, votes, required, "suspicion vote recorded");
                    if votes < required {
                        return Ok(VoteOutcome::Recorded { votes, required });
                    }
                    quorum_row = Some((row, version, required));
                }
                WriteOutcome::VersionConflict { current } => {
                    conflicts += 1;
                    if conflicts >= attempts {
                        warn!(
                            %target,
                            attempts,
                            current = current.version,
                            "DeclarationFailed: suspicion write kept losing version races, deferring to next cycle"
                        );
                        return Ok(VoteOutcome::Deferred { attempts });
                    }
                    debug!(%target, conflicts, current = current.version, "vote lost version race, refreshing");
                    self.cache.refresh().await?;
                }
                WriteOutcome::RowDead => {
                    self.cache.refresh().await?;
                    return Ok(VoteOutcome::AlreadyDead);
                }
                WriteOutcome::RowMissing => {
                    self.cache.refresh().await?;
                    return Ok(VoteOutcome::Ignored(IgnoreReason::UnknownSilo));
                }
            }
        }
    }
}
