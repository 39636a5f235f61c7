//! In-process devnet: node services plus a router standing in for the network

use alloy_primitives::{Address, keccak256};
use eyre::WrapErr;
use serde::{Deserialize, Serialize};
use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tessera_committee::Committee;
use tessera_consensus::ConsensusConfig;
use tessera_node::{
    MemoryStore, NodeConfig, NodeEvent, NodeHandle, WitnessNode, spawn_node_service,
};
use tessera_primitives::{Coin, GroupId, KeyError, OutPoint, Transaction, WitnessKey};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Amount of every genesis coin
const GENESIS_COIN: u64 = 1_000_000;

/// Devnet shape and node settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct DevnetConfig {
    /// Number of witness groups
    pub(crate) groups: u32,
    /// Witnesses in each group
    pub(crate) witnesses_per_group: usize,
    /// Genesis coins, each transferred once after startup
    pub(crate) transfers: usize,
    /// How long to run
    #[serde(with = "humantime_serde")]
    pub(crate) duration: Duration,
    /// Seed for witness keys
    pub(crate) seed: u64,
    /// Settings shared by every node
    pub(crate) node: NodeConfig,
}

impl Default for DevnetConfig {
    fn default() -> Self {
        let consensus = ConsensusConfig {
            round_change_timeout: Duration::from_secs(1),
            block_timeout: Duration::from_secs(2),
            vote_block_timeout: Duration::from_secs(1),
            commit_timeout: Duration::from_millis(500),
            skew_tolerance: Duration::from_millis(200),
            round_divisor: 1,
        };
        Self {
            groups: 3,
            witnesses_per_group: 3,
            transfers: 10,
            duration: Duration::from_secs(60),
            seed: 0,
            node: NodeConfig::default().with_consensus(consensus),
        }
    }
}

impl DevnetConfig {
    /// Load from a TOML file; missing keys keep their defaults
    pub(crate) fn load(path: &Path) -> eyre::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&raw).wrap_err_with(|| format!("failed to parse {}", path.display()))
    }

    /// Reject shapes that cannot run
    pub(crate) fn validate(&self) -> eyre::Result<()> {
        if self.groups == 0 {
            eyre::bail!("devnet needs at least one group");
        }
        if self.witnesses_per_group == 0 {
            eyre::bail!("devnet needs at least one witness per group");
        }
        Ok(())
    }
}

/// Counters gathered by the routers
#[derive(Debug, Default)]
struct Stats {
    finalized: AtomicU64,
    rolled_back: AtomicU64,
    committed: AtomicU64,
    bans: AtomicU64,
}

/// Totals reported when the devnet stops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Summary {
    pub(crate) finalized: u64,
    pub(crate) rolled_back: u64,
    pub(crate) committed: u64,
    pub(crate) bans: u64,
}

/// A running devnet
#[derive(Debug)]
pub(crate) struct Devnet {
    nodes: Vec<(GroupId, NodeHandle)>,
    routers: Vec<JoinHandle<()>>,
    stats: Arc<Stats>,
}

impl Devnet {
    /// Spawn every witness, wire the routers, join committees and submit the
    /// genesis transfers
    pub(crate) async fn launch(config: &DevnetConfig) -> eyre::Result<Self> {
        config.validate()?;

        let genesis = genesis_transaction(config.transfers);
        let node_config = config.node.clone().with_committee_count(config.groups as usize);

        let mut committees = Vec::new();
        let mut nodes = Vec::new();
        for group in 0..config.groups {
            let keys = (0..config.witnesses_per_group)
                .map(|index| witness_key(config.seed, group, index))
                .collect::<Result<Vec<_>, _>>()?;
            let ids: Vec<Address> = keys.iter().map(WitnessKey::id).collect();
            committees.push(Committee::with_majority(group, &ids)?);

            for key in keys {
                debug!(target: "tessera::devnet", group, witness = %key.id(), "Spawning witness");
                let store = MemoryStore::with_genesis([genesis.clone()]);
                let node = WitnessNode::new(node_config.clone(), key, store);
                nodes.push((group, spawn_node_service(node)));
            }
        }

        let stats = Arc::new(Stats::default());
        let routers = nodes
            .iter()
            .enumerate()
            .map(|(index, (group, handle))| {
                let router = Router {
                    group: *group,
                    from: handle.id(),
                    group_leader: index % config.witnesses_per_group == 0,
                    observer: index == 0,
                    peers: nodes.clone(),
                    stats: Arc::clone(&stats),
                };
                tokio::spawn(router.run(handle.subscribe()))
            })
            .collect();

        for (group, handle) in &nodes {
            handle.join_committee(committees[*group as usize].clone()).await?;
        }

        for (index, tx) in transfers(&genesis).into_iter().enumerate() {
            let group = (index % config.groups as usize) as GroupId;
            for (_, handle) in nodes.iter().filter(|(g, _)| *g == group) {
                handle.submit_transaction(tx.clone()).await?;
            }
        }

        info!(target: "tessera::devnet", witnesses = nodes.len(), "Devnet running");
        Ok(Self { nodes, routers, stats })
    }

    /// Blocks finalized so far, as seen by the first witness
    pub(crate) fn finalized(&self) -> u64 {
        self.stats.finalized.load(Ordering::Relaxed)
    }

    /// Stop every node and router
    pub(crate) async fn shutdown(self) -> Summary {
        for (_, handle) in &self.nodes {
            if let Err(err) = handle.shutdown().await {
                debug!(target: "tessera::devnet", witness = %handle.id(), %err, "Node already stopped");
            }
        }
        for router in &self.routers {
            router.abort();
        }

        Summary {
            finalized: self.stats.finalized.load(Ordering::Relaxed),
            rolled_back: self.stats.rolled_back.load(Ordering::Relaxed),
            committed: self.stats.committed.load(Ordering::Relaxed),
            bans: self.stats.bans.load(Ordering::Relaxed),
        }
    }
}

/// Carries one witness's outbound events to the rest of the devnet
#[derive(Debug)]
struct Router {
    group: GroupId,
    from: Address,
    /// First seat of its group; counts the group's commits
    group_leader: bool,
    /// Reports finality for the whole devnet
    observer: bool,
    peers: Vec<(GroupId, NodeHandle)>,
    stats: Arc<Stats>,
}

impl Router {
    async fn run(self, mut events: broadcast::Receiver<NodeEvent>) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "tessera::devnet", witness = %self.from, skipped, "Router lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            self.route(event).await;
        }
    }

    async fn route(&self, event: NodeEvent) {
        match event {
            NodeEvent::Broadcast { committee, message } => {
                for (group, peer) in &self.peers {
                    if *group == committee && peer.id() != self.from {
                        let _ = peer.deliver(self.from, message.clone()).await;
                    }
                }
            }
            NodeEvent::Committed { block, .. } => {
                if self.group_leader {
                    self.stats.committed.fetch_add(1, Ordering::Relaxed);
                }
                // other groups import; duplicates from fellow members are ignored
                for (group, peer) in &self.peers {
                    if *group != self.group {
                        let _ = peer.import_block(block.clone()).await;
                    }
                }
            }
            NodeEvent::Finalized(outcome) if self.observer => {
                self.stats.finalized.fetch_add(outcome.finalized.len() as u64, Ordering::Relaxed);
                self.stats.rolled_back.fetch_add(outcome.rollback.len() as u64, Ordering::Relaxed);
                info!(
                    target: "tessera::devnet",
                    finalized = outcome.finalized.len(),
                    rolled_back = outcome.rollback.len(),
                    top_stable = ?outcome.top_stable,
                    "Finality"
                );
            }
            NodeEvent::ProposerMisbehavior { committee, proposer, expected, voted } => {
                warn!(
                    target: "tessera::devnet",
                    committee,
                    %proposer,
                    ?expected,
                    %voted,
                    "Proposer misbehavior"
                );
            }
            NodeEvent::BanPeer { peer, reason } => {
                self.stats.bans.fetch_add(1, Ordering::Relaxed);
                warn!(target: "tessera::devnet", witness = %self.from, %peer, %reason, "Peer banned");
            }
            _ => {}
        }
    }
}

/// Deterministic witness key for a devnet seat
fn witness_key(seed: u64, group: GroupId, index: usize) -> Result<WitnessKey, KeyError> {
    let secret = keccak256(format!("tessera-devnet/{seed}/{group}/{index}"));
    WitnessKey::from_bytes(secret.as_slice())
}

fn faucet() -> Address {
    Address::from_word(keccak256(b"tessera-devnet/faucet"))
}

/// Mints `count` coins to the faucet; at least one
fn genesis_transaction(count: usize) -> Transaction {
    let outputs = (0..count.max(1)).map(|_| Coin::new(GENESIS_COIN, faucet())).collect();
    Transaction::new(vec![], outputs)
}

/// One transfer per genesis coin, each to its own receiver
fn transfers(genesis: &Transaction) -> Vec<Transaction> {
    genesis
        .indexed_outputs()
        .map(|(index, coin)| {
            let receiver = Address::from_word(keccak256(index.to_be_bytes()));
            Transaction::new(
                vec![OutPoint::new(genesis.hash(), index)],
                vec![Coin::new(coin.amount, receiver)],
            )
        })
        .collect()
}
