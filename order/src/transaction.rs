//! # Transactions and Transaction Sets
//!
//! The ordering layer does not interpret transactions. It needs three things
//! from them: a stable hash, the sender-scoped nonce (the engine's pool keys
//! on `(from, nonce)`), and a serialized size for the cache's memory limit.
//! Everything else travels as opaque bytes.
//!
//! A [`TxSet`] is what the transaction cache hands to the engine: an ordered
//! run of transactions plus one "local origin" flag per transaction. Sets are
//! built once and never mutated afterwards.

use serde::{Deserialize, Serialize};

use crate::crypto::hash::{blake3_hash_multi, Hash};

/// A signed client transaction.
///
/// Immutable once accepted: the cache and the engine only ever move or
/// clone it, and the hash covers every field except the signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Sender account. Nonces are scoped to this value.
    pub from: String,
    /// Receiver account. Empty for contract deployments and similar.
    pub to: String,
    /// Sender-scoped, strictly increasing sequence number.
    pub nonce: u64,
    /// Application payload. Opaque to ordering.
    pub payload: Vec<u8>,
    /// Client-side creation time, unix nanoseconds.
    pub timestamp: i64,
    /// Client signature over [`hash`](Self::hash). Checked by the executor,
    /// not by ordering.
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Unsigned transaction with an empty receiver.
    pub fn new(from: impl Into<String>, nonce: u64, payload: Vec<u8>) -> Self {
        Self {
            from: from.into(),
            to: String::new(),
            nonce,
            payload,
            timestamp: 0,
            signature: Vec::new(),
        }
    }

    /// BLAKE3 over `from || to || nonce || timestamp || payload`.
    pub fn hash(&self) -> Hash {
        blake3_hash_multi(&[
            self.from.as_bytes(),
            &[0u8],
            self.to.as_bytes(),
            &[0u8],
            &self.nonce.to_le_bytes(),
            &self.timestamp.to_le_bytes(),
            &self.payload,
        ])
    }

    /// Hex-encoded hash, for logs and the HTTP API.
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash())
    }

    /// Size of the bincode encoding, which is what goes over the wire
    /// inside a proposal.
    pub fn encoded_len(&self) -> usize {
        // Serializing a plain struct into a size counter cannot fail; if it
        // ever did, treating the transaction as huge makes the cache cut early.
        bincode::serialized_size(self)
            .map(|n| n as usize)
            .unwrap_or(usize::MAX)
    }
}

/// An ordered batch of transactions proposed to the engine as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSet {
    pub transactions: Vec<Transaction>,
    /// `local_list[i]` is true when `transactions[i]` was submitted to
    /// this replica rather than forwarded by a peer.
    pub local_list: Vec<bool>,
}

impl TxSet {
    /// A set where every transaction originated locally.
    pub fn local(transactions: Vec<Transaction>) -> Self {
        let local_list = vec![true; transactions.len()];
        Self {
            transactions,
            local_list,
        }
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Hashes of the member transactions, in order.
    pub fn hashes(&self) -> Vec<Hash> {
        self.transactions.iter().map(Transaction::hash).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_ignores_signature() {
        let tx = Transaction::new("alice", 1, b"transfer".to_vec());
        let mut signed = tx.clone();
        signed.signature = vec![0xAB; 64];
        assert_eq!(tx.hash(), signed.hash());
    }

    #[test]
    fn test_hash_covers_nonce_and_sender() {
        let a = Transaction::new("alice", 1, vec![]);
        assert_ne!(a.hash(), Transaction::new("alice", 2, vec![]).hash());
        assert_ne!(a.hash(), Transaction::new("bob", 1, vec![]).hash());
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        let mut a = Transaction::new("ab", 1, vec![]);
        a.to = "c".into();
        let mut b = Transaction::new("a", 1, vec![]);
        b.to = "bc".into();
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_encoded_len_grows_with_payload() {
        let small = Transaction::new("alice", 1, vec![0; 10]);
        let large = Transaction::new("alice", 1, vec![0; 1000]);
        assert_eq!(large.encoded_len() - small.encoded_len(), 990);
    }

    #[test]
    fn test_local_set_flags_every_entry() {
        let set = TxSet::local(vec![
            Transaction::new("alice", 1, vec![]),
            Transaction::new("alice", 2, vec![]),
        ]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.local_list, vec![true, true]);
        assert_eq!(set.hashes().len(), 2);
    }
}
