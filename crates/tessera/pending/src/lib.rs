//! Tessera Pending Block Graph
//!
//! Blocks that consensus committed but that are not yet final live in a DAG
//! keyed by block hash. Each vertex carries the cumulative [`StatePatch`] of
//! its branch.
//!
//! [`StatePatch`]: tessera_patch::StatePatch
//!
//! # Finality
//!
//! ```text
//! new vertex ──► walk every downward path, counting distinct witness groups
//!                    │
//!                    ▼  first vertex where count >= floor(n/2) + 1
//!               top-stable candidate
//!                    │
//!   merge candidate patches ──► cumulative patch (promote to storage)
//!   closure below candidates ──► removed as final
//!   tips incompatible with cumulative ──► rolled back to the mempool
//!   survivors ──► purged against cumulative
//! ```
//!
//! Group diversity, not vote count, is the signal: one group extending its
//! own chain never makes anything final on its own.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod finality;
mod graph;

#[cfg(test)]
mod test_utils;

pub use finality::FinalityOutcome;
pub use graph::{PendingBlockGraph, PendingVertex};

use tessera_patch::PatchError;
use tessera_primitives::BlockHash;
use thiserror::Error;

/// Pending graph errors
#[derive(Debug, Error)]
pub enum PendingGraphError {
    /// Vertex already present
    #[error("block {0} already pending")]
    DuplicateVertex(BlockHash),

    /// Vertex not present
    #[error("block {0} not in pending graph")]
    UnknownVertex(BlockHash),

    /// Patches of the newly stable vertices do not merge
    #[error("stable patches conflict: {0}")]
    StableConflict(#[from] PatchError),
}
