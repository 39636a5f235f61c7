//! Tessera Primitives
//!
//! Value types shared by every Tessera crate:
//! - Blocks, headers and the witness-group id that produced them
//! - UTXO transactions (`OutPoint`, `Coin`, `Transaction`)
//! - Witness identities and recoverable secp256k1 signatures

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod block;
pub mod key;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use key::{KeyError, WitnessKey, WitnessSignature, recover_signer};
pub use transaction::{Coin, OutPoint, Transaction};

use alloy_primitives::{Address, B256, keccak256};

/// Hash identifying a block
pub type BlockHash = B256;

/// Hash identifying a transaction
pub type TxHash = B256;

/// Identity of a witness, derived from its secp256k1 public key
pub type WitnessId = Address;

/// Witness group (committee) id
pub type GroupId = u32;

/// Hash used as the implicit DAG root when no pending blocks exist
pub fn default_genesis_hash() -> BlockHash {
    keccak256(b"TESSERA_GENESIS")
}
