//! The witness node state machine

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    time::Duration,
};
use tessera_committee::Committee;
use tessera_consensus::{
    ConsensusAction, ConsensusError, ConsensusState, WitnessConsensus, WitnessMessage,
};
use tessera_patch::{PatchError, StatePatch};
use tessera_pending::{FinalityOutcome, PendingBlockGraph};
use tessera_primitives::{Block, BlockHash, GroupId, Transaction, TxHash, WitnessId, WitnessKey};
use tracing::{debug, info, trace, warn};

use crate::{CoinStore, Mempool, NodeConfig, NodeError, TimerFired};

/// Output of a [`WitnessNode`] for the surrounding service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Send to every other member of `committee`
    Broadcast {
        /// Committee the message belongs to
        committee: GroupId,
        /// Signed message
        message: WitnessMessage,
    },
    /// Arm the committee's timer
    ScheduleTimeout {
        /// Committee
        committee: GroupId,
        /// State the timer belongs to
        state: ConsensusState,
        /// Round the timer belongs to
        round: u64,
        /// Delay
        after: Duration,
    },
    /// Stop the committee's timer
    CancelTimeout {
        /// Committee
        committee: GroupId,
    },
    /// A committee we sit on agreed on a block. Other groups need it too.
    Committed {
        /// Committee that agreed
        committee: GroupId,
        /// The block
        block: Block,
    },
    /// Blocks became final
    Finalized(FinalityOutcome),
    /// A committee voted for a block its proposer never sent us
    ProposerMisbehavior {
        /// Committee
        committee: GroupId,
        /// Round's proposer
        proposer: WitnessId,
        /// Block we held, if any
        expected: Option<BlockHash>,
        /// Block the committee voted for
        voted: BlockHash,
    },
    /// Disconnect a peer that violated the protocol
    BanPeer {
        /// Offending peer
        peer: WitnessId,
        /// Why
        reason: String,
    },
}

/// A witness: consensus for each committee it sits on, sharing one pending
/// graph, mempool and store.
#[derive(Debug)]
pub struct WitnessNode<S> {
    config: NodeConfig,
    key: WitnessKey,
    store: S,
    graph: PendingBlockGraph,
    committees: BTreeMap<GroupId, WitnessConsensus>,
    mempool: Mempool,
    /// Proposals handed to validation, per committee
    awaiting: HashMap<GroupId, Block>,
    /// Bodies of pending blocks
    bodies: HashMap<BlockHash, Block>,
    /// Committed blocks waiting for a parent, keyed by that parent
    orphans: HashMap<BlockHash, Vec<Block>>,
    /// Blocks already promoted to storage
    finalized: HashSet<BlockHash>,
    /// Height of the highest final block
    stable_height: u64,
    outbound: Vec<NodeEvent>,
}

impl<S: CoinStore> WitnessNode<S> {
    /// Create a new node on top of `store`
    pub fn new(config: NodeConfig, key: WitnessKey, store: S) -> Self {
        let graph = PendingBlockGraph::new(config.genesis_hash);
        Self {
            config,
            key,
            store,
            graph,
            committees: BTreeMap::new(),
            mempool: Mempool::new(),
            awaiting: HashMap::new(),
            bodies: HashMap::new(),
            orphans: HashMap::new(),
            finalized: HashSet::new(),
            stable_height: 0,
            outbound: Vec::new(),
        }
    }

    /// Local witness id
    pub const fn id(&self) -> WitnessId {
        self.key.id()
    }

    /// Node configuration
    pub const fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Durable store
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Pending block graph
    pub const fn graph(&self) -> &PendingBlockGraph {
        &self.graph
    }

    /// Queued transactions
    pub const fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    /// Consensus instance of a joined committee
    pub fn consensus(&self, committee: GroupId) -> Option<&WitnessConsensus> {
        self.committees.get(&committee)
    }

    /// Height of the highest final block
    pub const fn stable_height(&self) -> u64 {
        self.stable_height
    }

    /// Whether a block has been promoted to storage
    pub fn is_final(&self, hash: &BlockHash) -> bool {
        self.finalized.contains(hash)
    }

    /// Take everything the node wants done, oldest first
    pub fn drain_outbound(&mut self) -> Vec<NodeEvent> {
        std::mem::take(&mut self.outbound)
    }

    /// Queue a transaction for a future block; false if already queued
    pub fn submit_transaction(&mut self, tx: Transaction) -> bool {
        let hash = tx.hash();
        let queued = self.mempool.push(tx);
        trace!(target: "tessera::node", %hash, queued, "Transaction submitted");
        queued
    }

    /// Start consensus for a committee the local witness is a member of
    pub fn join_committee(&mut self, committee: Committee, now_ms: u64) -> Result<(), NodeError> {
        let id = committee.id();
        if self.committees.contains_key(&id) {
            return Err(NodeError::AlreadyJoined(id));
        }

        let mut consensus =
            WitnessConsensus::new(committee, self.key.clone(), self.config.consensus)?;
        consensus.start(now_ms)?;
        self.committees.insert(id, consensus);

        info!(target: "tessera::node", witness = %self.id(), committee = id, "Joined committee");
        self.drive(id)
    }

    /// Tear down every consensus instance
    pub fn shutdown(&mut self) {
        let ids: Vec<GroupId> = self.committees.keys().copied().collect();
        for id in ids {
            if let Some(consensus) = self.committees.get_mut(&id) {
                consensus.teardown();
            }
            if let Err(err) = self.drive(id) {
                warn!(target: "tessera::node", committee = id, %err, "Teardown failed");
            }
        }
        self.committees.clear();
        self.awaiting.clear();
    }

    /// Handle a consensus message delivered by peer `sender`
    pub fn handle_message(
        &mut self,
        sender: WitnessId,
        message: WitnessMessage,
    ) -> Result<(), NodeError> {
        let committee = message.committee_id;
        let consensus = self
            .committees
            .get_mut(&committee)
            .ok_or(ConsensusError::UnknownCommittee(committee))?;
        consensus.process(sender, message)?;
        self.drive(committee)
    }

    /// Handle an expired timer. Timers armed for a state or round the
    /// instance already left are ignored.
    pub fn handle_timeout(&mut self, fired: TimerFired, now_ms: u64) -> Result<(), NodeError> {
        let Some(consensus) = self.committees.get_mut(&fired.committee) else {
            trace!(target: "tessera::node", ?fired, "Timer for a committee we left");
            return Ok(());
        };
        if consensus.state() != fired.state || consensus.round() != fired.round {
            trace!(
                target: "tessera::node",
                ?fired,
                state = %consensus.state(),
                round = consensus.round(),
                "Stale timer"
            );
            return Ok(());
        }

        consensus.on_timeout(now_ms)?;
        self.drive(fired.committee)
    }

    /// Cast the committee's vote on the block handed to validation.
    ///
    /// Accepting with no block awaiting validation votes reject.
    pub fn handle_validation(&mut self, committee: GroupId, accepted: bool) -> Result<(), NodeError> {
        self.cast_vote(committee, accepted)?;
        self.drive(committee)
    }

    /// Add a committed block to the pending graph and re-run finality.
    ///
    /// Used for the local committees' commits and for blocks other groups
    /// committed. Known blocks are ignored; blocks with a parent we have not
    /// seen are parked until it arrives.
    pub fn import_block(&mut self, block: Block) -> Result<(), NodeError> {
        let hash = block.hash();
        if self.graph.contains(&hash) || self.finalized.contains(&hash) {
            trace!(target: "tessera::node", %hash, "Block already known");
            return Ok(());
        }
        if !block.tx_root_matches() {
            return Err(NodeError::InvalidBlock { hash, reason: "transaction root mismatch" });
        }
        if let Some(missing) =
            block.header.parent_hashes.iter().find(|parent| !self.is_known(parent)).copied()
        {
            debug!(target: "tessera::node", %hash, %missing, "Parking block until its parent arrives");
            self.orphans.entry(missing).or_default().push(block);
            return Ok(());
        }

        let patch = self.block_patch(&block)?;
        self.graph.add_vertex(block.header.clone(), patch)?;
        let included: Vec<TxHash> = block.transactions.iter().map(Transaction::hash).collect();
        self.mempool.remove(&included);

        info!(
            target: "tessera::node",
            %hash,
            height = block.header.height,
            group = block.header.group_id,
            txs = included.len(),
            pending = self.graph.len(),
            "Imported block"
        );
        self.bodies.insert(hash, block);

        if let Some(outcome) = self.graph.check_finality(&hash, self.config.committee_count)? {
            self.on_finality(outcome)?;
        }

        for child in self.orphans.remove(&hash).unwrap_or_default() {
            if let Err(err) = self.import_block(child) {
                warn!(target: "tessera::node", parent = %hash, %err, "Dropping parked block");
            }
        }
        Ok(())
    }

    /// Number of blocks waiting for a parent
    pub fn orphan_count(&self) -> usize {
        self.orphans.values().map(Vec::len).sum()
    }

    /// Run the committee's queued consensus actions until none are left
    fn drive(&mut self, committee: GroupId) -> Result<(), NodeError> {
        loop {
            let actions = match self.committees.get_mut(&committee) {
                Some(consensus) => consensus.drain_actions(),
                None => return Ok(()),
            };
            if actions.is_empty() {
                return Ok(());
            }
            for action in actions {
                self.on_action(committee, action)?;
            }
        }
    }

    fn on_action(&mut self, committee: GroupId, action: ConsensusAction) -> Result<(), NodeError> {
        match action {
            ConsensusAction::Broadcast(message) => {
                self.outbound.push(NodeEvent::Broadcast { committee, message });
            }
            ConsensusAction::BuildBlock { round } => {
                let block = self.build_block(committee, round);
                self.consensus_mut(committee)?.propose_block(block)?;
            }
            ConsensusAction::ValidateBlock(block) => {
                let hash = block.hash();
                let accepted = match self.validate_block(committee, &block) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(target: "tessera::node", committee, %hash, %err, "Rejecting proposal");
                        false
                    }
                };
                self.awaiting.insert(committee, block);
                self.cast_vote(committee, accepted)?;
            }
            ConsensusAction::Commit(block) => {
                let hash = block.hash();
                match self.import_block(block.clone()) {
                    Ok(()) => self.outbound.push(NodeEvent::Committed { committee, block }),
                    Err(err) => warn!(
                        target: "tessera::node",
                        committee,
                        %hash,
                        %err,
                        "Committee committed a block we cannot import, not forwarding it"
                    ),
                }
            }
            ConsensusAction::ScheduleTimeout { state, round, after } => {
                self.outbound.push(NodeEvent::ScheduleTimeout { committee, state, round, after });
            }
            ConsensusAction::CancelTimeout => {
                self.outbound.push(NodeEvent::CancelTimeout { committee });
            }
            ConsensusAction::ProposerMisbehavior { proposer, expected, voted } => {
                self.outbound.push(NodeEvent::ProposerMisbehavior {
                    committee,
                    proposer,
                    expected,
                    voted,
                });
            }
        }
        Ok(())
    }

    fn consensus_mut(&mut self, committee: GroupId) -> Result<&mut WitnessConsensus, NodeError> {
        self.committees
            .get_mut(&committee)
            .ok_or(NodeError::Consensus(ConsensusError::UnknownCommittee(committee)))
    }

    fn cast_vote(&mut self, committee: GroupId, accepted: bool) -> Result<(), NodeError> {
        let block = self.awaiting.remove(&committee);
        let consensus = self.consensus_mut(committee)?;
        match (accepted, block) {
            (true, Some(block)) => consensus.accept_block(block)?,
            (true, None) => {
                debug!(target: "tessera::node", committee, "No block awaiting validation, voting reject");
                consensus.reject_block()?;
            }
            (false, _) => consensus.reject_block()?,
        }
        Ok(())
    }

    /// Build our proposal on the best tips, with as many queued transactions
    /// as execute cleanly. Included transactions stay queued until their
    /// block is imported.
    fn build_block(&mut self, committee: GroupId, round: u64) -> Block {
        let (parents, mut patch) = self.graph.best_parents();
        let height = self.height_above(&parents);
        patch.bump_level(committee);

        let mut included = Vec::new();
        for tx in self.mempool.take(self.config.max_block_transactions) {
            match self.execute(&mut patch, &tx) {
                Ok(()) => included.push(tx),
                Err(err) => {
                    debug!(target: "tessera::node", hash = %tx.hash(), %err, "Dropping transaction")
                }
            }
        }
        self.mempool.return_transactions(included.iter().cloned());

        let round_ms =
            u64::try_from(self.config.consensus.round_duration().as_millis()).unwrap_or(u64::MAX);
        debug!(
            target: "tessera::node",
            committee,
            round,
            height,
            parents = parents.len(),
            txs = included.len(),
            "Built block"
        );
        Block::new(parents, height, committee, round.saturating_mul(round_ms), included)
    }

    fn validate_block(&self, committee: GroupId, block: &Block) -> Result<(), NodeError> {
        let hash = block.hash();
        let invalid = |reason| Err(NodeError::InvalidBlock { hash, reason });

        if block.header.group_id != committee {
            return invalid("produced by another group");
        }
        if block.header.parent_hashes.is_empty() {
            return invalid("no parents");
        }
        if block.transactions.len() > self.config.max_block_transactions {
            return invalid("too many transactions");
        }
        if !block.tx_root_matches() {
            return invalid("transaction root mismatch");
        }
        if !block.header.parent_hashes.iter().all(|parent| self.is_known(parent)) {
            return invalid("unknown parent");
        }
        if block.header.height != self.height_above(&block.header.parent_hashes) {
            return invalid("height does not follow parents");
        }

        self.block_patch(block).map(|_| ())
    }

    fn is_known(&self, hash: &BlockHash) -> bool {
        *hash == self.graph.genesis() ||
            self.graph.contains(hash) ||
            self.finalized.contains(hash) ||
            self.graph.top_stable().contains(hash)
    }

    /// One above the highest parent. Parents that left the graph sit at the
    /// stable height.
    fn height_above(&self, parents: &[BlockHash]) -> u64 {
        parents
            .iter()
            .map(|parent| self.graph.header(parent).map_or(self.stable_height, |h| h.height))
            .max()
            .unwrap_or(self.stable_height)
            .saturating_add(1)
    }

    /// Merged parent patches, plus this block's group level and transactions
    fn block_patch(&self, block: &Block) -> Result<StatePatch, NodeError> {
        let mut patch = StatePatch::new();
        for parent in &block.header.parent_hashes {
            if let Some(parent_patch) = self.graph.patch(parent) {
                patch = patch.merge(parent_patch)?;
            }
        }
        patch.bump_level(block.header.group_id);

        for tx in &block.transactions {
            self.execute(&mut patch, tx)?;
        }
        Ok(patch)
    }

    /// Apply a transaction to `patch`, leaving it untouched on failure
    fn execute(&self, patch: &mut StatePatch, tx: &Transaction) -> Result<(), NodeError> {
        let hash = tx.hash();
        if tx.inputs.is_empty() {
            return Err(NodeError::InvalidTransaction { hash, reason: "no inputs" });
        }

        let mut scratch = patch.clone();
        let mut input_total = 0u64;
        for input in &tx.inputs {
            let coin = scratch
                .coin_set(&input.tx_hash)
                .map(|set| set.get(input.index).copied())
                .unwrap_or_else(|| {
                    self.store.coin_set(&input.tx_hash).and_then(|set| set.get(input.index).copied())
                })
                .ok_or(PatchError::CoinNotFound(*input))?;
            input_total = input_total.saturating_add(coin.amount);
            scratch.spend_coin(*input, hash, |tx_hash| self.store.coin_set(tx_hash))?;
        }

        let output_total = tx.outputs.iter().fold(0u64, |acc, coin| acc.saturating_add(coin.amount));
        if output_total > input_total {
            return Err(NodeError::InvalidTransaction { hash, reason: "outputs exceed inputs" });
        }
        for (index, coin) in tx.indexed_outputs() {
            scratch.create_coin(hash, index, *coin);
        }

        *patch = scratch;
        Ok(())
    }

    fn on_finality(&mut self, outcome: FinalityOutcome) -> Result<(), NodeError> {
        self.store.apply(&outcome.patch)?;

        let mut settled = HashSet::new();
        for hash in &outcome.finalized {
            if let Some(block) = self.bodies.remove(hash) {
                self.stable_height = self.stable_height.max(block.header.height);
                settled.extend(block.transactions.iter().map(Transaction::hash));
            }
            self.finalized.insert(*hash);
        }

        let mut rolled_back = Vec::new();
        for hash in &outcome.rollback {
            if let Some(block) = self.bodies.remove(hash) {
                rolled_back.extend(block.transactions);
            }
        }
        // final or still carried by a surviving pending block
        settled.extend(
            self.bodies.values().flat_map(|block| block.transactions.iter().map(Transaction::hash)),
        );
        let returned: Vec<_> =
            rolled_back.into_iter().filter(|tx| !settled.contains(&tx.hash())).collect();
        if !returned.is_empty() {
            debug!(target: "tessera::node", txs = returned.len(), "Returning rolled back transactions");
        }
        self.mempool.return_transactions(returned);

        info!(
            target: "tessera::node",
            finalized = outcome.finalized.len(),
            rolled_back = outcome.rollback.len(),
            stable_height = self.stable_height,
            "Finalized blocks"
        );
        self.outbound.push(NodeEvent::Finalized(outcome));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use alloy_primitives::Address;
    use assert_matches::assert_matches;
    use tessera_consensus::{MessageContent, VoteTarget};
    use tessera_primitives::{Coin, OutPoint};

    fn key(seed: u8) -> WitnessKey {
        WitnessKey::from_bytes(&[seed; 32]).unwrap()
    }

    fn alice() -> Address {
        Address::repeat_byte(0xa1)
    }

    fn genesis_tx() -> Transaction {
        Transaction::new(vec![], vec![Coin::new(100, alice()), Coin::new(50, alice())])
    }

    fn transfer(index: u32, amount: u64, to: u8) -> Transaction {
        Transaction::new(
            vec![OutPoint::new(genesis_tx().hash(), index)],
            vec![Coin::new(amount, Address::repeat_byte(to))],
        )
    }

    fn node(seat: &WitnessKey, committee_count: usize) -> WitnessNode<MemoryStore> {
        let config = NodeConfig::default().with_committee_count(committee_count);
        WitnessNode::new(config, seat.clone(), MemoryStore::with_genesis([genesis_tx()]))
    }

    fn finalized(events: &[NodeEvent]) -> Vec<FinalityOutcome> {
        events
            .iter()
            .filter_map(|event| match event {
                NodeEvent::Finalized(outcome) => Some(outcome.clone()),
                _ => None,
            })
            .collect()
    }

    fn votes(events: &[NodeEvent]) -> Vec<VoteTarget> {
        events
            .iter()
            .filter_map(|event| match event {
                NodeEvent::Broadcast { message, .. } => match message.content {
                    MessageContent::BlockVote(target) => Some(target),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    /// Three-member committee 0, seated at `keys[1]`, in BLOCK for round 0
    /// waiting on `keys[0]`'s proposal
    fn waiting_for_proposal() -> ([WitnessKey; 3], WitnessNode<MemoryStore>) {
        let keys = [key(1), key(2), key(3)];
        let ids: Vec<_> = keys.iter().map(WitnessKey::id).collect();
        let mut node = node(&keys[1], 1);
        node.join_committee(Committee::with_majority(0, &ids).unwrap(), 0).unwrap();

        let round_change = WitnessMessage::signed(
            &keys[0],
            0,
            0,
            MessageContent::RoundChange { round: 0 },
            vec![],
        )
        .unwrap();
        node.handle_message(keys[0].id(), round_change).unwrap();
        assert_eq!(node.consensus(0).unwrap().state(), ConsensusState::Block);
        node.drain_outbound();
        (keys, node)
    }

    fn propose(keys: &[WitnessKey; 3], node: &mut WitnessNode<MemoryStore>, block: Block) {
        let proposal =
            WitnessMessage::signed(&keys[0], 0, 0, MessageContent::BlockProposal(block), vec![])
                .unwrap();
        node.handle_message(keys[0].id(), proposal).unwrap();
    }

    #[test]
    fn test_single_witness_finalizes_own_block() {
        let me = key(1);
        let mut node = node(&me, 1);
        let tx = transfer(0, 60, 0xb0);
        assert!(node.submit_transaction(tx.clone()));

        node.join_committee(Committee::with_majority(0, &[me.id()]).unwrap(), 0).unwrap();
        let events = node.drain_outbound();

        assert!(events.iter().any(|e| matches!(e, NodeEvent::Committed { committee: 0, .. })));
        let outcomes = finalized(&events);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].finalized.len(), 1);
        assert!(node.is_final(&outcomes[0].finalized[0]));

        assert_eq!(node.store().unspent(&OutPoint::new(genesis_tx().hash(), 0)), None);
        assert_eq!(node.store().unspent(&OutPoint::new(tx.hash(), 0)).map(|c| c.amount), Some(60));
        assert!(node.mempool().is_empty());
        assert!(node.graph().is_empty());
        assert_eq!(node.stable_height(), 1);
    }

    #[test]
    fn test_next_round_builds_on_top_stable() {
        let me = key(1);
        let mut node = node(&me, 1);
        node.join_committee(Committee::with_majority(0, &[me.id()]).unwrap(), 0).unwrap();
        let first = finalized(&node.drain_outbound())[0].finalized[0];

        let commit = TimerFired { committee: 0, state: ConsensusState::Commit, round: 0 };
        node.handle_timeout(commit, 0).unwrap();

        let events = node.drain_outbound();
        let committed: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                NodeEvent::Committed { block, .. } => Some(block.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].header.parent_hashes, vec![first]);
        assert_eq!(committed[0].header.height, 2);
        assert_eq!(node.stable_height(), 2);
    }

    #[test]
    fn test_stale_timer_ignored() {
        let me = key(1);
        let mut node = node(&me, 1);
        node.join_committee(Committee::with_majority(0, &[me.id()]).unwrap(), 0).unwrap();
        node.drain_outbound();

        let stale = TimerFired { committee: 0, state: ConsensusState::RoundChange, round: 0 };
        node.handle_timeout(stale, 0).unwrap();
        assert_eq!(node.consensus(0).unwrap().round(), 0);
        assert!(node.drain_outbound().is_empty());

        let unknown = TimerFired { committee: 9, state: ConsensusState::Commit, round: 0 };
        node.handle_timeout(unknown, 0).unwrap();
    }

    #[test]
    fn test_join_twice() {
        let me = key(1);
        let mut node = node(&me, 1);
        let committee = Committee::with_majority(0, &[me.id()]).unwrap();
        node.join_committee(committee.clone(), 0).unwrap();
        assert_matches!(node.join_committee(committee, 0), Err(NodeError::AlreadyJoined(0)));
    }

    #[test]
    fn test_message_for_unknown_committee_is_violation() {
        let keys = [key(1), key(2)];
        let mut node = node(&keys[0], 1);
        let message = WitnessMessage::signed(
            &keys[1],
            4,
            0,
            MessageContent::RoundChange { round: 0 },
            vec![],
        )
        .unwrap();

        let err = node.handle_message(keys[1].id(), message).unwrap_err();
        assert_matches!(err, NodeError::Consensus(ConsensusError::UnknownCommittee(4)));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_valid_proposal_accepted() {
        let (keys, mut node) = waiting_for_proposal();
        let genesis = node.config().genesis_hash;
        let block = Block::new(vec![genesis], 1, 0, 0, vec![transfer(0, 100, 0xb0)]);

        propose(&keys, &mut node, block.clone());
        assert_eq!(votes(&node.drain_outbound()), vec![VoteTarget::Accept(block.hash())]);
        assert_eq!(node.consensus(0).unwrap().candidate(), Some(&block));
    }

    #[test]
    fn test_invalid_proposals_rejected() {
        let overspend = transfer(1, 51, 0xb0);
        let cases = [
            ("unknown coin", Block::new(vec![], 1, 0, 0, vec![transfer(7, 1, 0xb0)])),
            ("overspend", Block::new(vec![], 1, 0, 0, vec![overspend])),
            ("mint", Block::new(vec![], 1, 0, 0, vec![Transaction::new(vec![], vec![])])),
            ("wrong group", Block::new(vec![], 1, 3, 0, vec![])),
            ("wrong height", Block::new(vec![], 5, 0, 0, vec![])),
            ("unknown parent", Block::new(vec![BlockHash::repeat_byte(7)], 1, 0, 0, vec![])),
        ];

        for (name, mut block) in cases {
            let (keys, mut node) = waiting_for_proposal();
            if block.header.parent_hashes.is_empty() {
                block.header.parent_hashes.push(node.config().genesis_hash);
            }
            propose(&keys, &mut node, block);
            assert_eq!(votes(&node.drain_outbound()), vec![VoteTarget::Reject], "{name}");
        }
    }

    #[test]
    fn test_validation_without_block_votes_reject() {
        let (_, mut node) = waiting_for_proposal();
        node.handle_validation(0, true).unwrap();
        assert_eq!(votes(&node.drain_outbound()), vec![VoteTarget::Reject]);
        assert_eq!(node.consensus(0).unwrap().state(), ConsensusState::VoteBlock);
    }

    #[test]
    fn test_foreign_blocks_finalize_across_groups() {
        let mut node = node(&key(1), 3);
        let genesis = node.config().genesis_hash;

        let a = Block::new(vec![genesis], 1, 1, 0, vec![transfer(0, 100, 0xb0)]);
        node.import_block(a.clone()).unwrap();
        assert!(finalized(&node.drain_outbound()).is_empty());

        let b = Block::new(vec![a.hash()], 2, 2, 0, vec![]);
        node.import_block(b.clone()).unwrap();
        let outcomes = finalized(&node.drain_outbound());
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].finalized, vec![a.hash()]);
        assert!(node.graph().contains(&b.hash()));

        // importing again is a no-op
        node.import_block(a).unwrap();
        assert!(node.drain_outbound().is_empty());
    }

    #[test]
    fn test_rollback_returns_transactions() {
        let mut node = node(&key(1), 3);
        let genesis = node.config().genesis_hash;
        let losing_tx = transfer(0, 100, 0xc0);
        let winning_tx = transfer(0, 90, 0xd0);

        let losing = Block::new(vec![genesis], 1, 5, 0, vec![losing_tx.clone()]);
        node.import_block(losing.clone()).unwrap();
        let first = Block::new(vec![genesis], 1, 1, 0, vec![winning_tx]);
        node.import_block(first.clone()).unwrap();
        assert!(!node.mempool().contains(&losing_tx.hash()));

        let second = Block::new(vec![first.hash()], 2, 2, 0, vec![]);
        node.import_block(second).unwrap();

        let outcomes = finalized(&node.drain_outbound());
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].finalized, vec![first.hash()]);
        assert_eq!(outcomes[0].rollback, vec![losing.hash()]);
        assert!(node.mempool().contains(&losing_tx.hash()));
        assert!(!node.graph().contains(&losing.hash()));
    }

    #[test]
    fn test_rollback_skips_transactions_kept_elsewhere() {
        let side_genesis = Transaction::new(vec![], vec![Coin::new(30, alice())]);
        let store = MemoryStore::with_genesis([genesis_tx(), side_genesis.clone()]);
        let config = NodeConfig::default().with_committee_count(3);
        let mut node = WitnessNode::new(config, key(1), store);
        let genesis = node.config().genesis_hash;

        let shared = transfer(0, 100, 0xb0);
        let losing_tx = transfer(1, 50, 0xc0);
        let winning_tx = transfer(1, 40, 0xd0);
        let pending_tx = Transaction::new(
            vec![OutPoint::new(side_genesis.hash(), 0)],
            vec![Coin::new(30, Address::repeat_byte(0xe0))],
        );

        let losing = Block::new(
            vec![genesis],
            1,
            5,
            0,
            vec![shared.clone(), losing_tx.clone(), pending_tx.clone()],
        );
        let surviving = Block::new(vec![genesis], 1, 7, 0, vec![pending_tx.clone()]);
        let first = Block::new(vec![genesis], 1, 1, 0, vec![shared.clone(), winning_tx]);
        let second = Block::new(vec![first.hash()], 2, 2, 0, vec![]);
        for block in [losing.clone(), surviving.clone(), first.clone(), second] {
            node.import_block(block).unwrap();
        }

        let outcomes = finalized(&node.drain_outbound());
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].finalized, vec![first.hash()]);
        assert_eq!(outcomes[0].rollback, vec![losing.hash()]);
        assert!(node.graph().contains(&surviving.hash()));

        assert!(node.mempool().contains(&losing_tx.hash()));
        assert!(!node.mempool().contains(&shared.hash()));
        assert!(!node.mempool().contains(&pending_tx.hash()));
        assert_eq!(node.mempool().len(), 1);
    }

    #[test]
    fn test_sibling_cannot_respend_final_output() {
        let mut node = node(&key(1), 3);
        let genesis = node.config().genesis_hash;
        let first_output = OutPoint::new(genesis_tx().hash(), 0);

        let a = Block::new(vec![genesis], 1, 1, 0, vec![transfer(0, 100, 0xb0)]);
        let c = Block::new(vec![genesis], 1, 3, 0, vec![transfer(1, 50, 0xc0)]);
        let b = Block::new(vec![a.hash()], 2, 2, 0, vec![]);
        for block in [a.clone(), c.clone(), b.clone()] {
            node.import_block(block).unwrap();
        }
        assert!(node.is_final(&a.hash()));
        assert!(node.graph().contains(&c.hash()));
        assert_eq!(node.store().unspent(&first_output), None);

        // builds on both tips and spends what `a` already spent
        let respend = Block::new(vec![b.hash(), c.hash()], 3, 1, 0, vec![transfer(0, 100, 0xf0)]);
        assert_matches!(
            node.import_block(respend.clone()),
            Err(NodeError::Patch(PatchError::CoinNotFound(outpoint))) if outpoint == first_output
        );
        assert!(!node.graph().contains(&respend.hash()));

        // the sibling finalizing later leaves the spent output spent
        let e = Block::new(vec![c.hash()], 2, 2, 0, vec![]);
        node.import_block(e).unwrap();
        assert!(node.is_final(&c.hash()));
        assert_eq!(node.store().unspent(&first_output), None);
        assert_eq!(node.store().unspent(&OutPoint::new(genesis_tx().hash(), 1)), None);
    }

    #[test]
    fn test_unimportable_commit_not_forwarded() {
        let (keys, mut node) = waiting_for_proposal();
        let genesis = node.config().genesis_hash;
        let block = Block::new(vec![genesis], 1, 0, 0, vec![transfer(7, 1, 0xb0)]);

        propose(&keys, &mut node, block.clone());
        assert_eq!(votes(&node.drain_outbound()), vec![VoteTarget::Reject]);

        // the other two members outvote us
        let accept = MessageContent::BlockVote(VoteTarget::Accept(block.hash()));
        for seat in [&keys[0], &keys[2]] {
            let vote = WitnessMessage::signed(seat, 0, 0, accept.clone(), vec![]).unwrap();
            node.handle_message(seat.id(), vote).unwrap();
        }

        assert_eq!(node.consensus(0).unwrap().state(), ConsensusState::Commit);
        let events = node.drain_outbound();
        assert!(!events.iter().any(|e| matches!(e, NodeEvent::Committed { .. })));
        assert!(!node.graph().contains(&block.hash()));
    }

    #[test]
    fn test_orphan_imported_with_parent() {
        let mut node = node(&key(1), 5);
        let genesis = node.config().genesis_hash;
        let parent = Block::new(vec![genesis], 1, 1, 0, vec![transfer(0, 100, 0xb0)]);
        let spend_again = Transaction::new(
            vec![OutPoint::new(transfer(0, 100, 0xb0).hash(), 0)],
            vec![Coin::new(100, Address::repeat_byte(0xc0))],
        );
        let child = Block::new(vec![parent.hash()], 2, 2, 0, vec![spend_again]);

        node.import_block(child.clone()).unwrap();
        assert!(node.graph().is_empty());
        assert_eq!(node.orphan_count(), 1);

        node.import_block(parent.clone()).unwrap();
        assert_eq!(node.orphan_count(), 0);
        assert!(node.graph().contains(&parent.hash()));
        assert!(node.graph().contains(&child.hash()));
    }

    #[test]
    fn test_import_rejects_tampered_body() {
        let mut node = node(&key(1), 3);
        let mut block = Block::new(vec![node.config().genesis_hash], 1, 1, 0, vec![]);
        block.transactions.push(transfer(0, 1, 0xb0));
        assert_matches!(node.import_block(block), Err(NodeError::InvalidBlock { .. }));
    }

    #[test]
    fn test_shutdown_cancels_timers() {
        let me = key(1);
        let mut node = node(&me, 1);
        node.join_committee(Committee::with_majority(0, &[me.id()]).unwrap(), 0).unwrap();
        node.drain_outbound();

        node.shutdown();
        assert_eq!(node.drain_outbound(), vec![NodeEvent::CancelTimeout { committee: 0 }]);
        assert!(node.consensus(0).is_none());
    }
}
