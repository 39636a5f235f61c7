//! Tessera State Patches
//!
//! A [`StatePatch`] is the speculative UTXO and contract delta attached to a
//! pending block. Patches of competing chain tips can be merged; a merge only
//! fails on a genuine double-spend. Contract state never conflicts fatally,
//! it is resolved by per-group level.
//!
//! # Lifecycle
//!
//! ```text
//! empty / decoded from storage
//!        │  spend_coin / create_coin / set_contract   (validating one block)
//!        ▼
//! block patch ──merge──► cumulative patch of a candidate tip
//!        │
//!        ▼
//! purge(final patch)   (block became final or was discarded)
//! ```

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod coins;
mod contract;
mod patch;

pub use coins::CoinSet;
pub use contract::ContractState;
pub use patch::StatePatch;

use tessera_primitives::{OutPoint, TxHash};
use thiserror::Error;

/// Patch errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    /// The same output was spent by two different transactions
    #[error("double spend of {outpoint}: spent by {first} and {second}")]
    DoubleSpend {
        /// The contested output
        outpoint: OutPoint,
        /// Spender recorded by the first patch
        first: TxHash,
        /// Spender recorded by the second patch
        second: TxHash,
    },

    /// The output is not unspent in the owned coin set
    #[error("output {0} is not unspent")]
    CoinNotFound(OutPoint),

    /// No coin set exists for the referenced transaction
    #[error("unknown coin set {0}")]
    UnknownCoinSet(TxHash),
}
