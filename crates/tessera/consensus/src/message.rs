//! Signed witness messages
//!
//! Every message signs `keccak(committee, round, content_hash)`. The content
//! hash never covers a signature, so the same vote signed by two witnesses
//! hashes the same and counts as the same value.

use alloy_primitives::{B256, keccak256};
use serde::{Deserialize, Serialize};
use tessera_primitives::{
    Block, BlockHash, GroupId, WitnessId, WitnessKey, WitnessSignature, recover_signer,
};

use crate::ConsensusError;

/// What a block vote points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteTarget {
    /// The block is valid
    Accept(BlockHash),
    /// No valid block this round
    Reject,
}

/// A value the committee can agree on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsensusValue {
    /// Next round number
    Round(u64),
    /// Verdict on the round's block
    Vote(VoteTarget),
}

impl ConsensusValue {
    /// Hash the value is compared by
    pub fn content_hash(&self) -> B256 {
        let mut data = Vec::with_capacity(48);
        match self {
            Self::Round(round) => {
                data.extend_from_slice(b"TESSERA_ROUND:");
                data.extend_from_slice(&round.to_be_bytes());
            }
            Self::Vote(VoteTarget::Accept(hash)) => {
                data.extend_from_slice(b"TESSERA_VOTE:");
                data.push(1);
                data.extend_from_slice(hash.as_slice());
            }
            Self::Vote(VoteTarget::Reject) => {
                data.extend_from_slice(b"TESSERA_VOTE:");
                data.push(0);
            }
        }
        keccak256(&data)
    }

    /// Whether both values belong to the same phase
    pub const fn same_kind(&self, other: &Self) -> bool {
        matches!((self, other), (Self::Round(_), Self::Round(_)) | (Self::Vote(_), Self::Vote(_)))
    }
}

/// Payload of a witness message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageContent {
    /// Proposal to move to `round`
    RoundChange {
        /// Proposed round
        round: u64,
    },
    /// Vote on the round's block
    BlockVote(VoteTarget),
    /// The proposer's block for the round
    BlockProposal(Block),
}

impl MessageContent {
    /// The agreement value carried, if any. Proposals carry none.
    pub const fn value(&self) -> Option<ConsensusValue> {
        match self {
            Self::RoundChange { round } => Some(ConsensusValue::Round(*round)),
            Self::BlockVote(target) => Some(ConsensusValue::Vote(*target)),
            Self::BlockProposal(_) => None,
        }
    }

    /// Content hash, equal to the carried value's hash for rounds and votes
    pub fn content_hash(&self) -> B256 {
        match self {
            Self::BlockProposal(block) => {
                let mut data = Vec::with_capacity(49);
                data.extend_from_slice(b"TESSERA_PROPOSAL:");
                data.extend_from_slice(block.hash().as_slice());
                keccak256(&data)
            }
            Self::RoundChange { round } => ConsensusValue::Round(*round).content_hash(),
            Self::BlockVote(target) => ConsensusValue::Vote(*target).content_hash(),
        }
    }
}

/// Prehash a witness signs for `content_hash` in `round` of `committee_id`
pub fn signing_hash(committee_id: GroupId, round: u64, content_hash: B256) -> B256 {
    let mut data = Vec::with_capacity(60);
    data.extend_from_slice(b"TESSERA_REPORT:");
    data.extend_from_slice(&committee_id.to_be_bytes());
    data.extend_from_slice(&round.to_be_bytes());
    data.extend_from_slice(content_hash.as_slice());
    keccak256(&data)
}

/// A first-hand report from `origin`, forwarded by another witness.
///
/// Carries the origin's own signature, so a relay cannot be forged, only
/// withheld.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayedReport {
    /// Witness that made the report
    pub origin: WitnessId,
    /// Round the origin reported in
    pub round: u64,
    /// Reported value
    pub value: ConsensusValue,
    /// Origin's signature
    pub signature: WitnessSignature,
}

impl RelayedReport {
    /// Check the signature recovers to `origin`
    pub fn verify(&self, committee_id: GroupId) -> Result<(), ConsensusError> {
        let prehash = signing_hash(committee_id, self.round, self.value.content_hash());
        match recover_signer(&prehash, &self.signature) {
            Ok(signer) if signer == self.origin => Ok(()),
            _ => Err(ConsensusError::BadSignature(self.origin)),
        }
    }
}

/// Signed message exchanged between members of one committee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessMessage {
    /// Committee the message belongs to
    pub committee_id: GroupId,
    /// Sender's round
    pub round: u64,
    /// Sender
    pub sender: WitnessId,
    /// Payload
    pub content: MessageContent,
    /// First-hand reports the sender received this phase
    pub relayed: Vec<RelayedReport>,
    /// Sender's signature over committee, round and content hash
    pub signature: WitnessSignature,
}

impl WitnessMessage {
    /// Build and sign a message
    pub fn signed(
        key: &WitnessKey,
        committee_id: GroupId,
        round: u64,
        content: MessageContent,
        relayed: Vec<RelayedReport>,
    ) -> Result<Self, ConsensusError> {
        let signature = key.sign(&signing_hash(committee_id, round, content.content_hash()))?;
        Ok(Self { committee_id, round, sender: key.id(), content, relayed, signature })
    }

    /// Prehash covered by [`Self::signature`]
    pub fn signing_hash(&self) -> B256 {
        signing_hash(self.committee_id, self.round, self.content.content_hash())
    }

    /// Check the signature recovers to [`Self::sender`]
    pub fn verify(&self) -> Result<(), ConsensusError> {
        match recover_signer(&self.signing_hash(), &self.signature) {
            Ok(signer) if signer == self.sender => Ok(()),
            _ => Err(ConsensusError::BadSignature(self.sender)),
        }
    }

    /// The sender's own report, in the form other witnesses relay it
    pub fn report(&self) -> Option<RelayedReport> {
        self.content.value().map(|value| RelayedReport {
            origin: self.sender,
            round: self.round,
            value,
            signature: self.signature,
        })
    }
}
