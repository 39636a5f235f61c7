//! Node configuration

use serde::{Deserialize, Serialize};
use tessera_consensus::ConsensusConfig;
use tessera_primitives::{BlockHash, default_genesis_hash};

/// Configuration of a witness node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Implicit DAG root while nothing is pending
    pub genesis_hash: BlockHash,
    /// Number of witness groups in the network; finality needs a majority of
    /// them on a path
    pub committee_count: usize,
    /// Upper bound on transactions per built block
    pub max_block_transactions: usize,
    /// Consensus timeouts
    pub consensus: ConsensusConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            genesis_hash: default_genesis_hash(),
            committee_count: 1,
            max_block_transactions: 256,
            consensus: ConsensusConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Set the genesis hash
    pub const fn with_genesis_hash(mut self, genesis_hash: BlockHash) -> Self {
        self.genesis_hash = genesis_hash;
        self
    }

    /// Set the number of witness groups, at least one
    pub fn with_committee_count(mut self, count: usize) -> Self {
        self.committee_count = count.max(1);
        self
    }

    /// Set the per-block transaction limit
    pub const fn with_max_block_transactions(mut self, max: usize) -> Self {
        self.max_block_transactions = max;
        self
    }

    /// Set the consensus config
    pub const fn with_consensus(mut self, consensus: ConsensusConfig) -> Self {
        self.consensus = consensus;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_partial_toml() {
        let config: NodeConfig = toml::from_str(
            r#"
            committee_count = 3

            [consensus]
            block_timeout = "1s"
            "#,
        )
        .unwrap();

        assert_eq!(config.committee_count, 3);
        assert_eq!(config.genesis_hash, default_genesis_hash());
        assert_eq!(config.consensus.block_timeout, Duration::from_secs(1));
        assert_eq!(config.consensus.commit_timeout, Duration::from_secs(4));
    }

    #[test]
    fn test_committee_count_floor() {
        assert_eq!(NodeConfig::default().with_committee_count(0).committee_count, 1);
    }
}
