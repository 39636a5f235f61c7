//! Contract state carried by a patch

use alloy_primitives::{B256, Bytes, keccak256};
use serde::{Deserialize, Serialize};
use tessera_primitives::GroupId;

/// Code and storage of one contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractState {
    /// Witness group the contract lives in; its level decides merge ties
    pub group_id: GroupId,
    /// Contract code
    pub code: Bytes,
    /// Serialized contract data
    pub data: Bytes,
}

impl ContractState {
    /// Create a new contract state
    pub fn new(group_id: GroupId, code: impl Into<Bytes>, data: impl Into<Bytes>) -> Self {
        Self { group_id, code: code.into(), data: data.into() }
    }

    /// Hash over the full contents
    pub fn content_hash(&self) -> B256 {
        let mut buf = Vec::with_capacity(8 + self.code.len() + self.data.len());
        buf.extend_from_slice(&self.group_id.to_be_bytes());
        buf.extend_from_slice(&(self.code.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.code);
        buf.extend_from_slice(&self.data);
        keccak256(&buf)
    }
}
