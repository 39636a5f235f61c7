//! Witness committee definitions
//!
//! A committee (witness group) is resolved outside the consensus core: the
//! membership selection (round-robin, stake weighting) happens upstream and
//! hands over an ordered member list plus a quorum rule. Consensus only reads
//! it; nothing here mutates after construction.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tessera_primitives::{GroupId, WitnessId};
use thiserror::Error;

/// Committee construction errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitteeError {
    /// No members supplied
    #[error("committee {0} has no members")]
    Empty(GroupId),

    /// Member listed twice
    #[error("witness {witness} listed twice in committee {committee}")]
    DuplicateMember {
        /// Committee id
        committee: GroupId,
        /// Repeated witness
        witness: WitnessId,
    },

    /// All members have zero weight
    #[error("committee {0} has zero total weight")]
    ZeroWeight(GroupId),

    /// Quorum rule can never be satisfied, or is trivially satisfied
    #[error("invalid quorum rule for committee {committee}: {reason}")]
    InvalidQuorum {
        /// Committee id
        committee: GroupId,
        /// What is wrong with the rule
        reason: &'static str,
    },
}

/// A committee member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Witness identity
    pub id: WitnessId,
    /// Voting weight
    pub weight: u64,
}

impl Member {
    /// Create a member with weight 1
    pub const fn new(id: WitnessId) -> Self {
        Self { id, weight: 1 }
    }

    /// Create a weighted member
    pub const fn weighted(id: WitnessId, weight: u64) -> Self {
        Self { id, weight }
    }
}

/// How much agreement a committee needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuorumRule {
    /// More than half of the members by count: `floor(n/2) + 1`
    #[default]
    Majority,
    /// At least this many members
    Count(usize),
    /// Agreeing weight is at least `numerator/denominator` of the total weight
    Weighted {
        /// Fraction numerator
        numerator: u64,
        /// Fraction denominator
        denominator: u64,
    },
}

/// An immutable, already-resolved witness committee
#[derive(Debug, Clone)]
pub struct Committee {
    id: GroupId,
    /// Members in proposer-rotation order
    members: Vec<Member>,
    index: HashMap<WitnessId, usize>,
    total_weight: u64,
    quorum: QuorumRule,
}

impl Committee {
    /// Create a committee from its ordered members
    pub fn new(
        id: GroupId,
        members: Vec<Member>,
        quorum: QuorumRule,
    ) -> Result<Self, CommitteeError> {
        if members.is_empty() {
            return Err(CommitteeError::Empty(id));
        }

        let mut index = HashMap::with_capacity(members.len());
        for (position, member) in members.iter().enumerate() {
            if index.insert(member.id, position).is_some() {
                return Err(CommitteeError::DuplicateMember { committee: id, witness: member.id });
            }
        }

        let total_weight = members.iter().fold(0u64, |acc, m| acc.saturating_add(m.weight));
        if total_weight == 0 {
            return Err(CommitteeError::ZeroWeight(id));
        }

        match quorum {
            QuorumRule::Count(0) => {
                return Err(CommitteeError::InvalidQuorum { committee: id, reason: "zero count" });
            }
            QuorumRule::Count(count) if count > members.len() => {
                return Err(CommitteeError::InvalidQuorum {
                    committee: id,
                    reason: "count exceeds committee size",
                });
            }
            QuorumRule::Weighted { denominator: 0, .. } => {
                return Err(CommitteeError::InvalidQuorum {
                    committee: id,
                    reason: "zero denominator",
                });
            }
            QuorumRule::Weighted { numerator, denominator } if numerator > denominator => {
                return Err(CommitteeError::InvalidQuorum {
                    committee: id,
                    reason: "fraction above one",
                });
            }
            _ => {}
        }

        Ok(Self { id, members, index, total_weight, quorum })
    }

    /// Equal-weight committee with a simple-majority quorum
    pub fn with_majority(id: GroupId, witnesses: &[WitnessId]) -> Result<Self, CommitteeError> {
        Self::new(id, witnesses.iter().copied().map(Member::new).collect(), QuorumRule::Majority)
    }

    /// Committee id (also the witness-group id stamped on its blocks)
    pub const fn id(&self) -> GroupId {
        self.id
    }

    /// Members in rotation order
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Member ids in rotation order
    pub fn member_ids(&self) -> impl Iterator<Item = WitnessId> + '_ {
        self.members.iter().map(|m| m.id)
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always false for a constructed committee
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Check membership
    pub fn is_member(&self, witness: &WitnessId) -> bool {
        self.index.contains_key(witness)
    }

    /// Weight of a member, zero for outsiders
    pub fn weight_of(&self, witness: &WitnessId) -> u64 {
        self.index.get(witness).map(|&i| self.members[i].weight).unwrap_or(0)
    }

    /// Total weight of all members
    pub const fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// The quorum rule
    pub const fn quorum(&self) -> QuorumRule {
        self.quorum
    }

    /// `floor(n/2) + 1`
    pub fn majority(&self) -> usize {
        self.len() / 2 + 1
    }

    /// Witness expected to propose in `round` (round-robin over members)
    pub fn proposer(&self, round: u64) -> WitnessId {
        let position = (round % self.members.len() as u64) as usize;
        self.members[position].id
    }

    /// Check whether the given witnesses agreeing is enough for quorum.
    ///
    /// Outsiders and repeated ids are ignored.
    pub fn quorum_reached<'a, I>(&self, agreeing: I) -> bool
    where
        I: IntoIterator<Item = &'a WitnessId>,
    {
        let agreeing: HashSet<&WitnessId> =
            agreeing.into_iter().filter(|id| self.is_member(id)).collect();

        match self.quorum {
            QuorumRule::Majority => agreeing.len() >= self.majority(),
            QuorumRule::Count(count) => agreeing.len() >= count,
            QuorumRule::Weighted { numerator, denominator } => {
                let weight: u128 = agreeing.iter().map(|id| self.weight_of(id) as u128).sum();
                weight > 0 &&
                    weight * denominator as u128 >= self.total_weight as u128 * numerator as u128
            }
        }
    }
}
