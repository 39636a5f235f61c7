//! Per-committee consensus state machine

use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, fmt, time::Duration};
use tessera_committee::Committee;
use tessera_primitives::{Block, BlockHash, GroupId, WitnessId, WitnessKey};
use tracing::{debug, info, trace, warn};

use crate::{
    ConsensusConfig, ConsensusError, ConsensusValue, ConsensusView, MessageContent, VoteTarget,
    WitnessMessage,
};

/// Phase of a consensus round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsensusState {
    /// Agreeing on the round number
    RoundChange,
    /// Waiting for the proposer's block and its local validation
    Block,
    /// Agreeing on the block vote
    VoteBlock,
    /// Block committed, waiting out the round
    Commit,
}

impl fmt::Display for ConsensusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RoundChange => "ROUND_CHANGE",
            Self::Block => "BLOCK",
            Self::VoteBlock => "VOTE_BLOCK",
            Self::Commit => "COMMIT",
        };
        f.write_str(name)
    }
}

/// Work the owner of a [`WitnessConsensus`] must carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusAction {
    /// Send to every other committee member
    Broadcast(WitnessMessage),
    /// The local witness proposes this round; build a block and hand it to
    /// [`WitnessConsensus::propose_block`]
    BuildBlock {
        /// Round to build for
        round: u64,
    },
    /// Validate the proposer's block, then call
    /// [`WitnessConsensus::accept_block`] or [`WitnessConsensus::reject_block`]
    ValidateBlock(Block),
    /// The committee agreed on this block
    Commit(Block),
    /// (Re)arm the committee's timer; fire [`WitnessConsensus::on_timeout`]
    /// if the instance is still in `state` for `round` when it expires
    ScheduleTimeout {
        /// State the timer belongs to
        state: ConsensusState,
        /// Round the timer belongs to
        round: u64,
        /// Delay
        after: Duration,
    },
    /// Stop the committee's timer
    CancelTimeout,
    /// The committee voted for a different block than the one the proposer sent us
    ProposerMisbehavior {
        /// Round's proposer
        proposer: WitnessId,
        /// Block we held, if any
        expected: Option<BlockHash>,
        /// Block the committee voted for
        voted: BlockHash,
    },
}

/// Round-based agreement for one committee, from the local witness's seat
#[derive(Debug)]
pub struct WitnessConsensus {
    committee: Committee,
    key: WitnessKey,
    config: ConsensusConfig,
    state: ConsensusState,
    round: u64,
    started: bool,
    view: ConsensusView,
    /// Block under vote this round
    candidate: Option<Block>,
    /// Proposal that arrived before we agreed on its round
    early_proposal: Option<(u64, Block)>,
    actions: VecDeque<ConsensusAction>,
}

impl WitnessConsensus {
    /// Create an instance for `committee`, signing with `key`.
    ///
    /// The instance is idle until [`Self::start`].
    pub fn new(
        committee: Committee,
        key: WitnessKey,
        config: ConsensusConfig,
    ) -> Result<Self, ConsensusError> {
        if !committee.is_member(&key.id()) {
            return Err(ConsensusError::NotMember(key.id()));
        }

        Ok(Self {
            committee,
            key,
            config,
            state: ConsensusState::RoundChange,
            round: 0,
            started: false,
            view: ConsensusView::new(),
            candidate: None,
            early_proposal: None,
            actions: VecDeque::new(),
        })
    }

    /// Committee id
    pub const fn committee_id(&self) -> GroupId {
        self.committee.id()
    }

    /// The committee this instance runs
    pub const fn committee(&self) -> &Committee {
        &self.committee
    }

    /// Current phase
    pub const fn state(&self) -> ConsensusState {
        self.state
    }

    /// Current round
    pub const fn round(&self) -> u64 {
        self.round
    }

    /// Whether [`Self::start`] ran and [`Self::teardown`] did not
    pub const fn is_started(&self) -> bool {
        self.started
    }

    /// Block under vote this round
    pub const fn candidate(&self) -> Option<&Block> {
        self.candidate.as_ref()
    }

    /// Take every queued action, oldest first
    pub fn drain_actions(&mut self) -> Vec<ConsensusAction> {
        self.actions.drain(..).collect()
    }

    /// Enter the round the network clock points at and announce it
    pub fn start(&mut self, now_ms: u64) -> Result<(), ConsensusError> {
        self.started = true;
        let round = self.config.derive_round(now_ms);
        info!(target: "tessera::consensus", committee = self.committee_id(), round, "Starting consensus");
        self.advance_to(round)
    }

    /// Stop the instance and cancel its timer
    pub fn teardown(&mut self) {
        debug!(target: "tessera::consensus", committee = self.committee_id(), "Tearing down");
        self.started = false;
        self.view = ConsensusView::new();
        self.candidate = None;
        self.early_proposal = None;
        self.actions.push_back(ConsensusAction::CancelTimeout);
    }

    /// Ingest a message from `sender`, already known to be the peer that
    /// delivered it.
    ///
    /// Returns the agreed value when this message completed a quorum.
    /// Protocol violations come back as errors; stale or out-of-phase
    /// messages are dropped silently.
    pub fn process(
        &mut self,
        sender: WitnessId,
        message: WitnessMessage,
    ) -> Result<Option<ConsensusValue>, ConsensusError> {
        if !self.started {
            return Err(ConsensusError::NotStarted(self.committee_id()));
        }
        self.verify(sender, &message)?;

        if message.round < self.round {
            trace!(
                target: "tessera::consensus",
                committee = self.committee_id(),
                %sender,
                round = message.round,
                local_round = self.round,
                "Dropping stale message"
            );
            return Ok(None);
        }

        match (&message.content, self.state) {
            (MessageContent::RoundChange { .. }, ConsensusState::RoundChange) => {
                self.record(&message);
                self.evaluate()
            }
            (MessageContent::BlockVote(_), ConsensusState::Block | ConsensusState::VoteBlock)
                if message.round == self.round =>
            {
                self.record(&message);
                self.evaluate()
            }
            (MessageContent::BlockProposal(block), _) => {
                self.on_proposal(sender, message.round, block.clone());
                Ok(None)
            }
            (content, state) => {
                trace!(
                    target: "tessera::consensus",
                    committee = self.committee_id(),
                    %sender,
                    ?content,
                    %state,
                    "Ignoring message for another phase"
                );
                Ok(None)
            }
        }
    }

    /// The timer for the current state expired without agreement
    pub fn on_timeout(&mut self, now_ms: u64) -> Result<(), ConsensusError> {
        if !self.started {
            return Err(ConsensusError::NotStarted(self.committee_id()));
        }

        debug!(
            target: "tessera::consensus",
            committee = self.committee_id(),
            round = self.round,
            state = %self.state,
            "Timeout"
        );

        let next = match self.state {
            ConsensusState::RoundChange => {
                self.round.max(self.config.derive_round(now_ms)).saturating_add(1)
            }
            ConsensusState::Block | ConsensusState::VoteBlock | ConsensusState::Commit => {
                self.round.saturating_add(1)
            }
        };
        self.advance_to(next)
    }

    /// Proposer path: broadcast our own block and vote for it
    pub fn propose_block(&mut self, block: Block) -> Result<(), ConsensusError> {
        if self.state != ConsensusState::Block || !self.is_proposer() {
            debug!(
                target: "tessera::consensus",
                committee = self.committee_id(),
                round = self.round,
                state = %self.state,
                "Not proposing outside our BLOCK phase"
            );
            return Ok(());
        }

        info!(
            target: "tessera::consensus",
            committee = self.committee_id(),
            round = self.round,
            hash = %block.hash(),
            txs = block.transactions.len(),
            "Proposing block"
        );
        self.submit(MessageContent::BlockProposal(block.clone()))?;
        self.accept_block(block)
    }

    /// The candidate block validated; vote for it
    pub fn accept_block(&mut self, block: Block) -> Result<(), ConsensusError> {
        if self.state != ConsensusState::Block {
            debug!(target: "tessera::consensus", state = %self.state, "Late block acceptance ignored");
            return Ok(());
        }

        let hash = block.hash();
        self.candidate = Some(block);
        self.enter(ConsensusState::VoteBlock);
        self.submit(MessageContent::BlockVote(VoteTarget::Accept(hash)))?;
        Ok(())
    }

    /// The candidate block failed validation, or never arrived; vote reject
    pub fn reject_block(&mut self) -> Result<(), ConsensusError> {
        if self.state != ConsensusState::Block {
            debug!(target: "tessera::consensus", state = %self.state, "Late block rejection ignored");
            return Ok(());
        }

        self.enter(ConsensusState::VoteBlock);
        self.submit(MessageContent::BlockVote(VoteTarget::Reject))?;
        Ok(())
    }

    fn is_proposer(&self) -> bool {
        self.committee.proposer(self.round) == self.key.id()
    }

    fn verify(&self, sender: WitnessId, message: &WitnessMessage) -> Result<(), ConsensusError> {
        if message.committee_id != self.committee_id() {
            return Err(ConsensusError::UnknownCommittee(message.committee_id));
        }
        if !self.committee.is_member(&sender) {
            return Err(ConsensusError::NotMember(sender));
        }
        if !self.committee.is_member(&message.sender) {
            return Err(ConsensusError::NotMember(message.sender));
        }
        if message.sender != sender {
            return Err(ConsensusError::BadSignature(sender));
        }
        message.verify()?;

        if let MessageContent::RoundChange { round } = message.content {
            if round != message.round {
                return Err(ConsensusError::RoundMismatch {
                    witness: message.sender,
                    round,
                    expected: message.round,
                });
            }
        }

        // relays are first-hand reports of the same phase, so of the same round
        for relay in &message.relayed {
            if !self.committee.is_member(&relay.origin) {
                return Err(ConsensusError::NotMember(relay.origin));
            }
            relay.verify(self.committee_id())?;

            let reported_round = match relay.value {
                ConsensusValue::Round(round) => round,
                ConsensusValue::Vote(_) => relay.round,
            };
            let claimed = if relay.round == message.round { reported_round } else { relay.round };
            if claimed != message.round {
                return Err(ConsensusError::RoundMismatch {
                    witness: relay.origin,
                    round: claimed,
                    expected: message.round,
                });
            }
        }
        Ok(())
    }

    /// Record the sender's own report and every same-kind relay it carries
    fn record(&mut self, message: &WitnessMessage) {
        let Some(report) = message.report() else { return };
        let value = report.value;
        self.view.record_first_hand(&self.committee, self.key.id(), report);

        for relay in message.relayed.iter().filter(|relay| relay.value.same_kind(&value)) {
            self.view.record(&self.committee, message.sender, relay.origin, relay.value);
        }
    }

    /// Check the view for agreement and act on it
    fn evaluate(&mut self) -> Result<Option<ConsensusValue>, ConsensusError> {
        let Some(value) = self.view.majority_of_majorities(&self.committee) else {
            return Ok(None);
        };

        match (self.state, value) {
            (ConsensusState::RoundChange, ConsensusValue::Round(round)) if round >= self.round => {
                self.enter_block(round);
            }
            (ConsensusState::VoteBlock, ConsensusValue::Vote(target)) => {
                self.on_vote_agreed(target)?;
            }
            _ => return Ok(None),
        }
        Ok(Some(value))
    }

    fn enter_block(&mut self, round: u64) {
        self.round = round;
        self.view = ConsensusView::new();
        self.enter(ConsensusState::Block);

        let proposer = self.committee.proposer(round);
        debug!(
            target: "tessera::consensus",
            committee = self.committee_id(),
            round,
            %proposer,
            "Agreed on round"
        );

        if proposer == self.key.id() {
            self.actions.push_back(ConsensusAction::BuildBlock { round });
        } else if self.early_proposal.as_ref().is_some_and(|(early, _)| *early == round) {
            if let Some((_, block)) = self.early_proposal.take() {
                self.candidate = Some(block.clone());
                self.actions.push_back(ConsensusAction::ValidateBlock(block));
            }
        }
    }

    fn on_proposal(&mut self, sender: WitnessId, round: u64, block: Block) {
        let proposer = self.committee.proposer(round);
        if sender != proposer {
            warn!(
                target: "tessera::consensus",
                committee = self.committee_id(),
                round,
                %sender,
                %proposer,
                "Block proposal from a witness that is not the round's proposer"
            );
            return;
        }

        match self.state {
            ConsensusState::Block if round == self.round && self.candidate.is_none() => {
                trace!(target: "tessera::consensus", hash = %block.hash(), round, "Received proposal");
                self.candidate = Some(block.clone());
                self.actions.push_back(ConsensusAction::ValidateBlock(block));
            }
            ConsensusState::RoundChange => {
                self.early_proposal = Some((round, block));
            }
            _ => {}
        }
    }

    fn on_vote_agreed(&mut self, target: VoteTarget) -> Result<(), ConsensusError> {
        let expected = self.candidate.as_ref().map(Block::hash);
        match target {
            VoteTarget::Accept(voted) if expected == Some(voted) => {
                let Some(block) = self.candidate.clone() else { return Ok(()) };
                info!(
                    target: "tessera::consensus",
                    committee = self.committee_id(),
                    round = self.round,
                    hash = %voted,
                    "Committee committed block"
                );
                self.view = ConsensusView::new();
                self.enter(ConsensusState::Commit);
                self.actions.push_back(ConsensusAction::Commit(block));
                Ok(())
            }
            VoteTarget::Accept(voted) => {
                let proposer = self.committee.proposer(self.round);
                warn!(
                    target: "tessera::consensus",
                    committee = self.committee_id(),
                    round = self.round,
                    %proposer,
                    ?expected,
                    %voted,
                    "Committee voted for a block the proposer did not send us"
                );
                self.actions.push_back(ConsensusAction::ProposerMisbehavior {
                    proposer,
                    expected,
                    voted,
                });
                self.advance_to(self.round.saturating_add(1))
            }
            VoteTarget::Reject => {
                debug!(
                    target: "tessera::consensus",
                    committee = self.committee_id(),
                    round = self.round,
                    "Committee rejected the round's block"
                );
                self.advance_to(self.round.saturating_add(1))
            }
        }
    }

    /// Start `round` from scratch and announce it
    fn advance_to(&mut self, round: u64) -> Result<(), ConsensusError> {
        debug!(
            target: "tessera::consensus",
            committee = self.committee_id(),
            from = self.round,
            to = round,
            "Advancing round"
        );
        self.round = round;
        self.view = ConsensusView::new();
        self.candidate = None;
        if self.early_proposal.as_ref().is_some_and(|(early, _)| *early < round) {
            self.early_proposal = None;
        }
        self.enter(ConsensusState::RoundChange);
        self.submit(MessageContent::RoundChange { round })?;
        Ok(())
    }

    fn enter(&mut self, state: ConsensusState) {
        self.state = state;
        self.actions.push_back(ConsensusAction::ScheduleTimeout {
            state,
            round: self.round,
            after: self.config.timeout(state),
        });
    }

    /// Sign and broadcast `content`, then count it as our own report
    fn submit(&mut self, content: MessageContent) -> Result<Option<ConsensusValue>, ConsensusError> {
        let message = WitnessMessage::signed(
            &self.key,
            self.committee_id(),
            self.round,
            content,
            self.view.relays(&self.key.id()),
        )?;
        self.actions.push_back(ConsensusAction::Broadcast(message.clone()));

        if message.content.value().is_none() {
            return Ok(None);
        }
        self.record(&message);
        self.evaluate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn key(seed: u8) -> WitnessKey {
        WitnessKey::from_bytes(&[seed; 32]).unwrap()
    }

    /// Committee of `keys` in the given order, seated at `keys[seat]`
    fn instance(keys: &[WitnessKey], seat: usize) -> WitnessConsensus {
        let ids: Vec<_> = keys.iter().map(WitnessKey::id).collect();
        let committee = Committee::with_majority(0, &ids).unwrap();
        WitnessConsensus::new(committee, keys[seat].clone(), ConsensusConfig::default()).unwrap()
    }

    fn message(key: &WitnessKey, round: u64, content: MessageContent) -> WitnessMessage {
        WitnessMessage::signed(key, 0, round, content, vec![]).unwrap()
    }

    fn block(nonce: u64) -> Block {
        Block::new(vec![BlockHash::ZERO], 1, 0, nonce, vec![])
    }

    fn commits(actions: &[ConsensusAction]) -> Vec<BlockHash> {
        actions
            .iter()
            .filter_map(|action| match action {
                ConsensusAction::Commit(block) => Some(block.hash()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_key_must_be_member() {
        let committee = Committee::with_majority(0, &[key(1).id()]).unwrap();
        assert_matches!(
            WitnessConsensus::new(committee, key(2), ConsensusConfig::default()),
            Err(ConsensusError::NotMember(_))
        );
    }

    #[test]
    fn test_input_before_start() {
        let keys = [key(1), key(2)];
        let mut consensus = instance(&keys, 0);

        assert_matches!(consensus.on_timeout(0), Err(ConsensusError::NotStarted(0)));
        assert_matches!(
            consensus.process(keys[1].id(), message(&keys[1], 0, MessageContent::RoundChange { round: 0 })),
            Err(ConsensusError::NotStarted(0))
        );
    }

    #[test]
    fn test_committee_of_one_runs_alone() {
        let keys = [key(1)];
        let mut consensus = instance(&keys, 0);

        consensus.start(0).unwrap();
        assert_eq!(consensus.state(), ConsensusState::Block);
        let actions = consensus.drain_actions();
        assert!(actions.contains(&ConsensusAction::BuildBlock { round: 0 }));

        let proposed = block(1);
        consensus.propose_block(proposed.clone()).unwrap();
        assert_eq!(consensus.state(), ConsensusState::Commit);
        assert_eq!(commits(&consensus.drain_actions()), vec![proposed.hash()]);

        // COMMIT times out into ROUND_CHANGE, which settles at once
        consensus.on_timeout(0).unwrap();
        assert_eq!(consensus.round(), 1);
        assert_eq!(consensus.state(), ConsensusState::Block);
    }

    #[test]
    fn test_committee_of_one_process_returns_own_value() {
        let keys = [key(1)];
        let mut consensus = instance(&keys, 0);
        // started, but our own round change not yet fed back
        consensus.started = true;

        let value = consensus
            .process(keys[0].id(), message(&keys[0], 5, MessageContent::RoundChange { round: 5 }))
            .unwrap();
        assert_eq!(value, Some(ConsensusValue::Round(5)));
        assert_eq!(consensus.round(), 5);
        assert_eq!(consensus.state(), ConsensusState::Block);
    }

    #[test]
    fn test_two_members_must_both_agree() {
        let keys = [key(1), key(2)];
        let mut consensus = instance(&keys, 0);
        consensus.start(0).unwrap();

        let other = message(&keys[1], 1, MessageContent::RoundChange { round: 1 });
        assert_eq!(consensus.process(keys[1].id(), other.clone()).unwrap(), None);
        assert_eq!(consensus.process(keys[1].id(), other).unwrap(), None);
        assert_eq!(consensus.state(), ConsensusState::RoundChange);

        let agreeing = message(&keys[1], 0, MessageContent::RoundChange { round: 0 });
        assert_eq!(
            consensus.process(keys[1].id(), agreeing).unwrap(),
            Some(ConsensusValue::Round(0))
        );
    }

    #[test]
    fn test_two_of_three_round_agreement() {
        let keys = [key(1), key(2), key(3)];
        let mut consensus = instance(&keys, 0);
        consensus.start(0).unwrap();
        assert_eq!(consensus.state(), ConsensusState::RoundChange);

        let value = consensus
            .process(keys[1].id(), message(&keys[1], 0, MessageContent::RoundChange { round: 0 }))
            .unwrap();
        assert_eq!(value, Some(ConsensusValue::Round(0)));
        assert_eq!(consensus.state(), ConsensusState::Block);
        // members[0] proposes round 0
        assert!(consensus.drain_actions().contains(&ConsensusAction::BuildBlock { round: 0 }));
    }

    #[test]
    fn test_independently_signed_votes_aggregate() {
        let keys = [key(1), key(2), key(3)];
        let mut consensus = instance(&keys, 0);
        consensus.start(0).unwrap();
        consensus
            .process(keys[1].id(), message(&keys[1], 0, MessageContent::RoundChange { round: 0 }))
            .unwrap();

        let proposed = block(7);
        consensus.propose_block(proposed.clone()).unwrap();
        consensus.drain_actions();

        // same content as our vote, under another witness's signature
        let vote = MessageContent::BlockVote(VoteTarget::Accept(proposed.hash()));
        let value = consensus.process(keys[2].id(), message(&keys[2], 0, vote)).unwrap();
        assert_eq!(value, Some(ConsensusValue::Vote(VoteTarget::Accept(proposed.hash()))));
        assert_eq!(consensus.state(), ConsensusState::Commit);
        assert_eq!(commits(&consensus.drain_actions()), vec![proposed.hash()]);
    }

    #[test]
    fn test_rejecting_witness_still_follows_committee() {
        let keys = [key(1), key(2), key(3)];
        let mut consensus = instance(&keys, 2);
        consensus.start(0).unwrap();
        consensus
            .process(keys[1].id(), message(&keys[1], 0, MessageContent::RoundChange { round: 0 }))
            .unwrap();

        let proposed = block(3);
        consensus
            .process(keys[0].id(), message(&keys[0], 0, MessageContent::BlockProposal(proposed.clone())))
            .unwrap();
        assert!(consensus.drain_actions().contains(&ConsensusAction::ValidateBlock(proposed.clone())));

        consensus.reject_block().unwrap();
        let vote = MessageContent::BlockVote(VoteTarget::Accept(proposed.hash()));
        consensus.process(keys[0].id(), message(&keys[0], 0, vote.clone())).unwrap();
        assert_eq!(consensus.state(), ConsensusState::VoteBlock);
        consensus.process(keys[1].id(), message(&keys[1], 0, vote)).unwrap();

        assert_eq!(consensus.state(), ConsensusState::Commit);
        assert_eq!(commits(&consensus.drain_actions()), vec![proposed.hash()]);
    }

    #[test]
    fn test_committee_reject_advances_round() {
        let keys = [key(1), key(2), key(3)];
        let mut consensus = instance(&keys, 1);
        consensus.start(0).unwrap();
        consensus
            .process(keys[0].id(), message(&keys[0], 0, MessageContent::RoundChange { round: 0 }))
            .unwrap();

        consensus.reject_block().unwrap();
        consensus
            .process(keys[2].id(), message(&keys[2], 0, MessageContent::BlockVote(VoteTarget::Reject)))
            .unwrap();

        assert_eq!(consensus.state(), ConsensusState::RoundChange);
        assert_eq!(consensus.round(), 1);
        assert!(consensus.candidate().is_none());
    }

    #[test]
    fn test_proposer_misbehavior_reported() {
        let keys = [key(1), key(2), key(3)];
        let mut consensus = instance(&keys, 1);
        consensus.start(0).unwrap();
        consensus
            .process(keys[2].id(), message(&keys[2], 0, MessageContent::RoundChange { round: 0 }))
            .unwrap();

        let sent_to_us = block(1);
        let voted = block(2).hash();
        consensus
            .process(keys[0].id(), message(&keys[0], 0, MessageContent::BlockProposal(sent_to_us.clone())))
            .unwrap();
        consensus.accept_block(sent_to_us.clone()).unwrap();

        let vote = MessageContent::BlockVote(VoteTarget::Accept(voted));
        consensus.process(keys[0].id(), message(&keys[0], 0, vote.clone())).unwrap();
        consensus.process(keys[2].id(), message(&keys[2], 0, vote)).unwrap();

        let actions = consensus.drain_actions();
        assert!(actions.contains(&ConsensusAction::ProposerMisbehavior {
            proposer: keys[0].id(),
            expected: Some(sent_to_us.hash()),
            voted,
        }));
        assert!(commits(&actions).is_empty());
        assert_eq!(consensus.round(), 1);
        assert_eq!(consensus.state(), ConsensusState::RoundChange);
    }

    #[test]
    fn test_proposal_from_non_proposer_ignored() {
        let keys = [key(1), key(2), key(3)];
        let mut consensus = instance(&keys, 2);
        consensus.start(0).unwrap();
        consensus
            .process(keys[1].id(), message(&keys[1], 0, MessageContent::RoundChange { round: 0 }))
            .unwrap();
        consensus.drain_actions();

        consensus
            .process(keys[1].id(), message(&keys[1], 0, MessageContent::BlockProposal(block(1))))
            .unwrap();
        assert!(consensus.drain_actions().is_empty());
        assert!(consensus.candidate().is_none());
    }

    #[test]
    fn test_early_proposal_kept_until_round_agreed() {
        let keys = [key(1), key(2), key(3)];
        let mut consensus = instance(&keys, 2);
        consensus.start(0).unwrap();

        let proposed = block(4);
        consensus
            .process(keys[0].id(), message(&keys[0], 0, MessageContent::BlockProposal(proposed.clone())))
            .unwrap();
        consensus
            .process(keys[1].id(), message(&keys[1], 0, MessageContent::RoundChange { round: 0 }))
            .unwrap();

        assert!(consensus.drain_actions().contains(&ConsensusAction::ValidateBlock(proposed.clone())));
        assert_eq!(consensus.candidate(), Some(&proposed));
    }

    #[test]
    fn test_protocol_violations() {
        let keys = [key(1), key(2), key(3)];
        let outsider = key(9);
        let mut consensus = instance(&keys, 0);
        consensus.start(0).unwrap();

        let foreign = WitnessMessage::signed(&keys[1], 4, 0, MessageContent::RoundChange { round: 0 }, vec![])
            .unwrap();
        let err = consensus.process(keys[1].id(), foreign).unwrap_err();
        assert_matches!(err, ConsensusError::UnknownCommittee(4));
        assert!(err.is_protocol_violation());

        let err = consensus
            .process(outsider.id(), message(&outsider, 0, MessageContent::RoundChange { round: 0 }))
            .unwrap_err();
        assert_matches!(err, ConsensusError::NotMember(id) if id == outsider.id());

        let mut forged = message(&outsider, 0, MessageContent::RoundChange { round: 0 });
        forged.sender = keys[1].id();
        assert_matches!(
            consensus.process(keys[1].id(), forged),
            Err(ConsensusError::BadSignature(_))
        );

        let mut relaying = message(&keys[1], 0, MessageContent::RoundChange { round: 0 });
        relaying.relayed = vec![message(&outsider, 0, MessageContent::RoundChange { round: 0 }).report().unwrap()];
        assert_matches!(consensus.process(keys[1].id(), relaying), Err(ConsensusError::NotMember(_)));
        assert_eq!(consensus.state(), ConsensusState::RoundChange);
    }

    #[test]
    fn test_relayed_reports_count() {
        let keys = [key(1), key(2), key(3), key(4)];
        let mut consensus = instance(&keys, 0);
        consensus.start(0).unwrap();

        // witness 2 relays what witness 3 told it
        let relayed = message(&keys[2], 0, MessageContent::RoundChange { round: 0 }).report().unwrap();
        let mut carrying = message(&keys[1], 0, MessageContent::RoundChange { round: 0 });
        carrying.relayed = vec![relayed];
        assert_eq!(consensus.process(keys[1].id(), carrying).unwrap(), Some(ConsensusValue::Round(0)));
    }

    /// Four-member instance seated at `keys[0]`, in ROUND_CHANGE for round 5
    fn at_round_five(keys: &[WitnessKey]) -> WitnessConsensus {
        let mut consensus = instance(keys, 0);
        consensus.start(0).unwrap();
        for _ in 0..5 {
            consensus.on_timeout(0).unwrap();
        }
        assert_eq!(consensus.round(), 5);
        consensus.drain_actions();
        consensus
    }

    #[test]
    fn test_round_change_must_name_its_own_round() {
        let keys = [key(1), key(2), key(3), key(4)];
        let mut consensus = at_round_five(&keys);

        let backwards = message(&keys[1], 5, MessageContent::RoundChange { round: 1 });
        let err = consensus.process(keys[1].id(), backwards).unwrap_err();
        assert_matches!(err, ConsensusError::RoundMismatch { round: 1, expected: 5, .. });
        assert!(err.is_protocol_violation());
        assert_eq!(consensus.round(), 5);
        assert_eq!(consensus.state(), ConsensusState::RoundChange);
    }

    #[test]
    fn test_relays_from_another_round_rejected() {
        let keys = [key(1), key(2), key(3), key(4)];
        let mut consensus = at_round_five(&keys);

        // genuine reports from round 1, replayed inside a round 5 message
        let old: Vec<_> = keys[2..]
            .iter()
            .map(|origin| message(origin, 1, MessageContent::RoundChange { round: 1 }).report().unwrap())
            .collect();
        let mut replaying = message(&keys[1], 5, MessageContent::RoundChange { round: 5 });
        replaying.relayed = old;
        assert_matches!(
            consensus.process(keys[1].id(), replaying),
            Err(ConsensusError::RoundMismatch { witness, round: 1, expected: 5 }) if witness == keys[2].id()
        );

        // a report signed for round 5 but naming round 1
        let inconsistent = message(&keys[2], 5, MessageContent::RoundChange { round: 1 }).report().unwrap();
        let mut carrying = message(&keys[1], 5, MessageContent::RoundChange { round: 5 });
        carrying.relayed = vec![inconsistent];
        assert_matches!(
            consensus.process(keys[1].id(), carrying),
            Err(ConsensusError::RoundMismatch { round: 1, expected: 5, .. })
        );

        assert_eq!(consensus.round(), 5);
        assert_eq!(consensus.state(), ConsensusState::RoundChange);
    }

    #[test]
    fn test_agreement_on_lower_round_ignored() {
        let keys = [key(1), key(2), key(3), key(4)];
        let mut consensus = at_round_five(&keys);

        let committee = consensus.committee().clone();
        for member in &keys {
            consensus.view.record(&committee, member.id(), member.id(), ConsensusValue::Round(1));
        }
        assert_eq!(consensus.evaluate().unwrap(), None);
        assert_eq!(consensus.round(), 5);
        assert_eq!(consensus.state(), ConsensusState::RoundChange);
    }

    #[test]
    fn test_timeout_strictly_increases_round() {
        let keys = [key(1), key(2), key(3)];
        let mut consensus = instance(&keys, 0);
        consensus.start(0).unwrap();

        let mut last = consensus.round();
        for _ in 0..5 {
            consensus.on_timeout(0).unwrap();
            assert!(consensus.round() > last);
            assert_eq!(consensus.round(), last + 1);
            last = consensus.round();
        }

        // clock correction jumps ahead but still strictly increases
        let round_ms = ConsensusConfig::default().round_duration().as_millis() as u64;
        consensus.on_timeout(round_ms * 100).unwrap();
        assert_eq!(consensus.round(), 101);
    }

    #[test]
    fn test_stale_messages_dropped() {
        let keys = [key(1), key(2), key(3)];
        let mut consensus = instance(&keys, 0);
        consensus.start(0).unwrap();
        consensus.on_timeout(0).unwrap();
        consensus.on_timeout(0).unwrap();
        assert_eq!(consensus.round(), 2);

        let stale = message(&keys[1], 1, MessageContent::RoundChange { round: 1 });
        assert_eq!(consensus.process(keys[1].id(), stale).unwrap(), None);
        assert_eq!(consensus.state(), ConsensusState::RoundChange);
    }

    #[test]
    fn test_block_and_commit_timeouts_advance() {
        let keys = [key(1)];
        let mut consensus = instance(&keys, 0);
        consensus.start(0).unwrap();
        assert_eq!(consensus.state(), ConsensusState::Block);

        consensus.on_timeout(0).unwrap();
        assert_eq!(consensus.round(), 1);

        consensus.propose_block(block(1)).unwrap();
        assert_eq!(consensus.state(), ConsensusState::Commit);
        consensus.on_timeout(0).unwrap();
        assert_eq!(consensus.round(), 2);
    }

    #[test]
    fn test_timeouts_scheduled_per_state() {
        let keys = [key(1), key(2)];
        let mut consensus = instance(&keys, 0);
        consensus.start(0).unwrap();

        let actions = consensus.drain_actions();
        assert_matches!(
            actions.first(),
            Some(ConsensusAction::ScheduleTimeout { state: ConsensusState::RoundChange, round: 0, after })
                if *after == ConsensusConfig::default().round_change_timeout
        );
        assert_matches!(actions.get(1), Some(ConsensusAction::Broadcast(_)));

        consensus.teardown();
        assert!(!consensus.is_started());
        assert_eq!(consensus.drain_actions(), vec![ConsensusAction::CancelTimeout]);
    }

    /// Route actions between fully connected instances until quiet
    fn run(nodes: &mut [WitnessConsensus]) -> Vec<Vec<BlockHash>> {
        let mut committed = vec![Vec::new(); nodes.len()];
        let mut queue = VecDeque::new();

        loop {
            for (index, node) in nodes.iter_mut().enumerate() {
                for action in node.drain_actions() {
                    match action {
                        ConsensusAction::Broadcast(message) => {
                            for peer in 0..committed.len() {
                                if peer != index {
                                    queue.push_back((peer, message.clone()));
                                }
                            }
                        }
                        ConsensusAction::BuildBlock { round } => {
                            node.propose_block(block(round)).unwrap();
                        }
                        ConsensusAction::ValidateBlock(block) => node.accept_block(block).unwrap(),
                        ConsensusAction::Commit(block) => committed[index].push(block.hash()),
                        _ => {}
                    }
                }
            }

            let Some((peer, message)) = queue.pop_front() else { break };
            nodes[peer].process(message.sender, message).unwrap();
        }
        committed
    }

    #[test]
    fn test_three_witnesses_commit_same_block() {
        let keys = [key(1), key(2), key(3)];
        let mut nodes: Vec<_> = (0..3).map(|seat| instance(&keys, seat)).collect();
        for node in &mut nodes {
            node.start(0).unwrap();
        }

        let committed = run(&mut nodes);

        let expected = vec![block(0).hash()];
        assert_eq!(committed, vec![expected.clone(), expected.clone(), expected]);
        assert!(nodes.iter().all(|node| node.state() == ConsensusState::Commit));
    }
}
