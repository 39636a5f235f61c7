//! Majority-of-majorities aggregation

use alloy_primitives::B256;
use std::collections::{BTreeMap, HashMap};
use tessera_committee::Committee;
use tessera_primitives::WitnessId;
use tracing::trace;

use crate::{ConsensusValue, RelayedReport};

/// One phase's picture of who reported what.
///
/// `reports[reporter][origin]` is the value `reporter` says it received from
/// `origin`. Each witness is its own first reporter, and the local witness
/// reports everything it received first-hand. Only committee members are
/// accepted on either side.
#[derive(Debug, Default)]
pub struct ConsensusView {
    reports: BTreeMap<WitnessId, BTreeMap<WitnessId, B256>>,
    values: HashMap<B256, ConsensusValue>,
    /// Reports received directly from their origin, relayed on our next message
    first_hand: BTreeMap<WitnessId, RelayedReport>,
}

impl ConsensusView {
    /// Create an empty view
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// Record that `reporter` claims `origin` reported `value`.
    ///
    /// Returns false, recording nothing, when either side is not a member.
    pub fn record(
        &mut self,
        committee: &Committee,
        reporter: WitnessId,
        origin: WitnessId,
        value: ConsensusValue,
    ) -> bool {
        if !committee.is_member(&reporter) || !committee.is_member(&origin) {
            return false;
        }

        let hash = value.content_hash();
        self.values.insert(hash, value);
        self.reports.entry(reporter).or_default().insert(origin, hash);
        true
    }

    /// Record a report the local witness received straight from its origin.
    ///
    /// The origin vouches for its own value, and so does `local`.
    pub fn record_first_hand(
        &mut self,
        committee: &Committee,
        local: WitnessId,
        report: RelayedReport,
    ) -> bool {
        let origin = report.origin;
        if !self.record(committee, origin, origin, report.value) {
            return false;
        }
        self.record(committee, local, origin, report.value);
        self.first_hand.insert(origin, report);
        true
    }

    /// First-hand reports to forward, except the one from `exclude`
    pub fn relays(&self, exclude: &WitnessId) -> Vec<RelayedReport> {
        self.first_hand
            .iter()
            .filter(|(origin, _)| *origin != exclude)
            .map(|(_, report)| report.clone())
            .collect()
    }

    /// Majority among everything reported about `origin`, if one value has
    /// strictly more than half of those reports
    pub fn origin_majority(&self, origin: &WitnessId) -> Option<B256> {
        let mut counts: BTreeMap<B256, usize> = BTreeMap::new();
        let mut total = 0usize;
        for reported in self.reports.values() {
            if let Some(hash) = reported.get(origin) {
                *counts.entry(*hash).or_default() += 1;
                total += 1;
            }
        }

        counts.into_iter().find(|(_, count)| *count * 2 > total).map(|(hash, _)| hash)
    }

    /// The value the committee agrees on, if any.
    ///
    /// For every member, take the majority of what was reported about it;
    /// members whose majority is the same value form its supporters. The
    /// first value (by content hash) whose supporters reach the committee
    /// quorum wins. A committee of one agrees with its only member directly.
    pub fn majority_of_majorities(&self, committee: &Committee) -> Option<ConsensusValue> {
        if committee.len() == 1 {
            let only = committee.member_ids().next()?;
            let hash = self.reports.get(&only)?.get(&only)?;
            return self.values.get(hash).copied();
        }

        let mut supporters: BTreeMap<B256, Vec<WitnessId>> = BTreeMap::new();
        for member in committee.member_ids() {
            if let Some(hash) = self.origin_majority(&member) {
                supporters.entry(hash).or_default().push(member);
            }
        }

        let (hash, members) =
            supporters.into_iter().find(|(_, members)| committee.quorum_reached(members))?;
        trace!(
            target: "tessera::consensus",
            committee = committee.id(),
            %hash,
            supporters = members.len(),
            "Quorum reached"
        );
        self.values.get(&hash).copied()
    }
}
