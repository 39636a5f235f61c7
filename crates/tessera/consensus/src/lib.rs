//! Tessera Witness Consensus
//!
//! One [`WitnessConsensus`] instance runs per witness committee. It agrees on
//! a round number, then on a block for that round, aggregating messages into a
//! majority-of-majorities [`ConsensusView`].
//!
//! # Round lifecycle
//!
//! ```text
//! ROUND_CHANGE ──quorum on round──► BLOCK ──accept/reject──► VOTE_BLOCK ──quorum──► COMMIT
//!      ▲                              │                          │                    │
//!      └──────────── timeout ─────────┴──── reject / mismatch ───┴───── timeout ──────┘
//! ```
//!
//! The instance never talks to the network or a clock itself. Inputs arrive
//! through [`WitnessConsensus::process`], [`WitnessConsensus::on_timeout`] and
//! the validation callbacks; everything it wants done is queued as a
//! [`ConsensusAction`] and taken with [`WitnessConsensus::drain_actions`].

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod config;
pub mod message;
pub mod view;
pub mod witness;

pub use config::{ConsensusConfig, derive_round};
pub use message::{ConsensusValue, MessageContent, RelayedReport, VoteTarget, WitnessMessage};
pub use view::ConsensusView;
pub use witness::{ConsensusAction, ConsensusState, WitnessConsensus};

use tessera_primitives::{GroupId, KeyError, WitnessId};
use thiserror::Error;

/// Consensus errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusError {
    /// Message addressed to a committee this instance does not run
    #[error("unknown committee {0}")]
    UnknownCommittee(GroupId),

    /// Sender or relayed origin outside the committee
    #[error("witness {0} is not a committee member")]
    NotMember(WitnessId),

    /// Signature does not recover to the claimed witness
    #[error("bad signature from {0}")]
    BadSignature(WitnessId),

    /// A round report stamped with another round than the message carrying it
    #[error("report from {witness} for round {round} inside a round {expected} message")]
    RoundMismatch {
        /// Witness whose report is inconsistent
        witness: WitnessId,
        /// Round the report claims
        round: u64,
        /// Round of the carrying message
        expected: u64,
    },

    /// Input delivered before [`WitnessConsensus::start`]
    #[error("consensus for committee {0} not started")]
    NotStarted(GroupId),

    /// Local signing failed
    #[error(transparent)]
    Key(#[from] KeyError),
}

impl ConsensusError {
    /// Whether the peer that delivered the message should be dropped and banned
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::UnknownCommittee(_) |
                Self::NotMember(_) |
                Self::BadSignature(_) |
                Self::RoundMismatch { .. }
        )
    }
}
