//! Consensus timeouts and network-time rounds

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ConsensusState;

/// Per-state timeouts and round clock parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// How long to wait for agreement on the next round
    #[serde(with = "humantime_serde")]
    pub round_change_timeout: Duration,
    /// How long the proposer has to deliver a block
    #[serde(with = "humantime_serde")]
    pub block_timeout: Duration,
    /// How long to wait for agreement on the block vote
    #[serde(with = "humantime_serde")]
    pub vote_block_timeout: Duration,
    /// Grace period after committing so slower peers catch up
    #[serde(with = "humantime_serde")]
    pub commit_timeout: Duration,
    /// Tolerated clock skew between witnesses
    #[serde(with = "humantime_serde")]
    pub skew_tolerance: Duration,
    /// Divides the sum of all timeouts into the round duration
    pub round_divisor: u32,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            round_change_timeout: Duration::from_secs(4),
            block_timeout: Duration::from_secs(10),
            vote_block_timeout: Duration::from_secs(4),
            commit_timeout: Duration::from_secs(4),
            skew_tolerance: Duration::from_secs(1),
            round_divisor: 1,
        }
    }
}

impl ConsensusConfig {
    /// Timeout armed on entering `state`
    pub const fn timeout(&self, state: ConsensusState) -> Duration {
        match state {
            ConsensusState::RoundChange => self.round_change_timeout,
            ConsensusState::Block => self.block_timeout,
            ConsensusState::VoteBlock => self.vote_block_timeout,
            ConsensusState::Commit => self.commit_timeout,
        }
    }

    /// Length of one network-time round. A zero divisor counts as one.
    pub fn round_duration(&self) -> Duration {
        let total = self.round_change_timeout +
            self.block_timeout +
            self.vote_block_timeout +
            self.commit_timeout;
        total / self.round_divisor.max(1)
    }

    /// Round number the network clock points at for `now_ms`
    pub fn derive_round(&self, now_ms: u64) -> u64 {
        derive_round(
            now_ms,
            self.skew_tolerance.as_millis() as u64,
            self.round_duration().as_millis() as u64,
        )
    }

    /// Set all four state timeouts
    pub const fn with_timeouts(
        mut self,
        round_change: Duration,
        block: Duration,
        vote_block: Duration,
        commit: Duration,
    ) -> Self {
        self.round_change_timeout = round_change;
        self.block_timeout = block;
        self.vote_block_timeout = vote_block;
        self.commit_timeout = commit;
        self
    }
}

/// Deterministic round number for a wall-clock time in milliseconds.
///
/// Witnesses whose clocks differ by less than `skew_tolerance_ms` land on the
/// same round except right at a boundary. A zero round duration yields round 0.
pub const fn derive_round(now_ms: u64, skew_tolerance_ms: u64, round_duration_ms: u64) -> u64 {
    match now_ms.saturating_add(skew_tolerance_ms).checked_div(round_duration_ms) {
        Some(round) => round,
        None => 0,
    }
}
