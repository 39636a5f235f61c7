use alloy_primitives::{Address, B256};
use tessera_patch::{CoinSet, StatePatch};
use tessera_primitives::{BlockHash, BlockHeader, Coin, GroupId, OutPoint, TxHash};

pub(crate) fn genesis() -> BlockHash {
    BlockHash::repeat_byte(0xee)
}

/// `nonce` only exists to make otherwise identical headers distinct
pub(crate) fn header(parents: &[BlockHash], height: u64, group: GroupId, nonce: u64) -> BlockHeader {
    BlockHeader {
        parent_hashes: parents.to_vec(),
        height,
        group_id: group,
        timestamp: nonce,
        tx_root: B256::ZERO,
    }
}

/// Patch spending output `index` of stored tx `source` with tx `spender`
pub(crate) fn spend(source: u8, index: u32, spender: u8) -> StatePatch {
    let mut patch = StatePatch::new();
    patch
        .spend_coin(
            OutPoint::new(TxHash::repeat_byte(source), index),
            TxHash::repeat_byte(spender),
            |hash: &TxHash| {
                let mut set = CoinSet::new(*hash);
                for i in 0..4 {
                    set.add(i, Coin::new(1, Address::ZERO));
                }
                Some(set)
            },
        )
        .unwrap();
    patch
}
