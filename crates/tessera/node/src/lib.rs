//! Tessera Witness Node
//!
//! Wires the consensus instances of every committee the local witness sits
//! on to one pending block graph and the durable coin store.
//!
//! ```text
//!  peer message / timer ──► WitnessConsensus ──actions──► WitnessNode
//!                                                          │  BuildBlock    → best parents + mempool
//!                                                          │  ValidateBlock → execute on parent patch
//!                                                          │  Commit        → pending graph, finality
//!                                                          ▼
//!                                                      NodeEvent (broadcast, timers, finality)
//! ```
//!
//! [`WitnessNode`] is synchronous and owns all state. [`spawn_node_service`]
//! runs it on a single tokio task, so every input is handled strictly in
//! arrival order.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod config;
pub mod mempool;
pub mod node;
pub mod service;
pub mod store;
pub mod timers;

pub use config::NodeConfig;
pub use mempool::Mempool;
pub use node::{NodeEvent, WitnessNode};
pub use service::{NodeHandle, NodeService, ServiceMessage, spawn_node_service, unix_millis};
pub use store::{CoinStore, MemoryStore};
pub use timers::{TimerFired, TimerManager};

use tessera_consensus::ConsensusError;
use tessera_patch::PatchError;
use tessera_pending::PendingGraphError;
use tessera_primitives::{BlockHash, GroupId, TxHash};
use thiserror::Error;

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    /// Consensus rejected an input
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    /// Pending graph failure
    #[error(transparent)]
    Pending(#[from] PendingGraphError),

    /// Transaction or patch could not be applied
    #[error(transparent)]
    Patch(#[from] PatchError),

    /// Already running consensus for this committee
    #[error("already joined committee {0}")]
    AlreadyJoined(GroupId),

    /// Block failed structural checks
    #[error("block {hash} invalid: {reason}")]
    InvalidBlock {
        /// Block hash
        hash: BlockHash,
        /// What failed
        reason: &'static str,
    },

    /// Transaction cannot execute on the state it was built on
    #[error("transaction {hash} invalid: {reason}")]
    InvalidTransaction {
        /// Transaction hash
        hash: TxHash,
        /// What failed
        reason: &'static str,
    },

    /// Durable storage failure
    #[error("storage: {0}")]
    Store(String),

    /// The node service task is gone
    #[error("node service stopped")]
    ServiceStopped,
}

impl NodeError {
    /// Whether the peer that caused this should be banned
    pub const fn is_protocol_violation(&self) -> bool {
        match self {
            Self::Consensus(err) => err.is_protocol_violation(),
            _ => false,
        }
    }
}
