//! # Blocks and Commit Events
//!
//! A block is what ordering hands to the rest of the node: the engine's
//! agreed transaction order at one height, linked to the previous height.
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  BlockHeader                                │
//! │  ├── version: String                        │
//! │  ├── height: u64                            │
//! │  ├── parent_hash: [u8; 32]                  │
//! │  ├── timestamp: i64      (engine-supplied)  │
//! │  ├── tx_root: [u8; 32]   (Merkle root)      │
//! │  └── hash: [u8; 32]      (BLAKE3 of above)  │
//! ├─────────────────────────────────────────────┤
//! │  transactions: Vec<Transaction>             │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Assembly is a pure function of its inputs. Two replicas fed the same
//! engine output produce byte-identical blocks, which is the whole point.

use serde::{Deserialize, Serialize};

use crate::crypto::hash::{blake3_hash_multi, merkle_root, Hash};
use crate::transaction::Transaction;

/// Header version written into every block.
pub const BLOCK_VERSION: &str = "1.0.0";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: String,
    pub height: u64,
    pub parent_hash: Hash,
    /// Unix nanoseconds, as supplied by the engine for this height.
    pub timestamp: i64,
    pub tx_root: Hash,
    pub hash: Hash,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Build a block at `height` on top of `parent_hash`.
    pub fn new(
        height: u64,
        parent_hash: Hash,
        timestamp: i64,
        transactions: Vec<Transaction>,
    ) -> Self {
        let leaves: Vec<Hash> = transactions.iter().map(Transaction::hash).collect();
        let tx_root = merkle_root(&leaves);
        let hash = compute_header_hash(BLOCK_VERSION, height, &parent_hash, timestamp, &tx_root);

        Self {
            header: BlockHeader {
                version: BLOCK_VERSION.to_string(),
                height,
                parent_hash,
                timestamp,
                tx_root,
                hash,
            },
            transactions,
        }
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn hash(&self) -> Hash {
        self.header.hash
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.header.hash)
    }

    /// Check that the stored hash and transaction root match the contents.
    ///
    /// Blocks fetched from peers during state transfer go through this
    /// before they are trusted.
    pub fn verify(&self) -> Result<(), String> {
        let leaves: Vec<Hash> = self.transactions.iter().map(Transaction::hash).collect();
        if merkle_root(&leaves) != self.header.tx_root {
            return Err(format!("tx root mismatch at height {}", self.header.height));
        }
        let expected = compute_header_hash(
            &self.header.version,
            self.header.height,
            &self.header.parent_hash,
            self.header.timestamp,
            &self.header.tx_root,
        );
        if expected != self.header.hash {
            return Err(format!("header hash mismatch at height {}", self.header.height));
        }
        Ok(())
    }
}

/// `BLAKE3(version || height || parent_hash || timestamp || tx_root)`.
fn compute_header_hash(
    version: &str,
    height: u64,
    parent_hash: &Hash,
    timestamp: i64,
    tx_root: &Hash,
) -> Hash {
    blake3_hash_multi(&[
        version.as_bytes(),
        &height.to_le_bytes(),
        parent_hash,
        &timestamp.to_le_bytes(),
        tx_root,
    ])
}

/// A finalized block plus which of its transactions this replica accepted
/// from its own clients. Produced once per height; the consumer owns it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEvent {
    pub block: Block,
    /// Parallel to `block.transactions`. Blocks obtained through state
    /// transfer carry no local transactions.
    pub local_list: Vec<bool>,
}

impl CommitEvent {
    /// The transactions this replica is expected to answer clients about.
    pub fn local_transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.block
            .transactions
            .iter()
            .zip(self.local_list.iter())
            .filter_map(|(tx, local)| local.then_some(tx))
    }
}

/// The synchronization token exchanged with the engine: "height `applied`
/// has been executed and its block hash is `digest`".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    pub applied: u64,
    /// Hex-encoded block hash.
    pub digest: String,
}

impl ServiceState {
    pub fn new(applied: u64, digest: impl Into<String>) -> Self {
        Self {
            applied,
            digest: digest.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::ZERO_HASH;

    fn txs(n: u64) -> Vec<Transaction> {
        (1..=n).map(|i| Transaction::new("alice", i, vec![i as u8])).collect()
    }

    #[test]
    fn test_assembly_is_deterministic() {
        let a = Block::new(5, [1u8; 32], 1_700_000_000, txs(3));
        let b = Block::new(5, [1u8; 32], 1_700_000_000, txs(3));
        assert_eq!(a, b);
        assert!(a.verify().is_ok());
    }

    #[test]
    fn test_hash_depends_on_parent_and_timestamp() {
        let base = Block::new(5, ZERO_HASH, 10, txs(1));
        assert_ne!(base.hash(), Block::new(5, [1u8; 32], 10, txs(1)).hash());
        assert_ne!(base.hash(), Block::new(5, ZERO_HASH, 11, txs(1)).hash());
    }

    #[test]
    fn test_verify_detects_tampering() {
        let mut block = Block::new(2, ZERO_HASH, 10, txs(2));
        block.transactions[0].nonce = 99;
        assert!(block.verify().is_err());

        let mut block = Block::new(2, ZERO_HASH, 10, txs(2));
        block.header.height = 3;
        assert!(block.verify().is_err());
    }

    #[test]
    fn test_local_transactions_filter() {
        let event = CommitEvent {
            block: Block::new(1, ZERO_HASH, 0, txs(3)),
            local_list: vec![true, false, true],
        };
        let nonces: Vec<u64> = event.local_transactions().map(|tx| tx.nonce).collect();
        assert_eq!(nonces, vec![1, 3]);
    }

    #[test]
    fn test_short_local_list_is_not_a_panic() {
        let event = CommitEvent {
            block: Block::new(1, ZERO_HASH, 0, txs(3)),
            local_list: vec![true],
        };
        assert_eq!(event.local_transactions().count(), 1);
    }
}
