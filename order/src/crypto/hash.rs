//! # Hashing Utilities
//!
//! BLAKE3 is the only hash function the ordering layer uses. Transaction
//! hashes, block hashes, transaction roots, and the digest that signatures
//! cover on consensus messages all come out of this module.
//!
//! Hashes are plain `[u8; 32]` arrays. Hex encoding happens at the edges
//! (logs, the engine's `ServiceState` digest, the HTTP API) and nowhere else.

/// A 32-byte BLAKE3 digest.
pub type Hash = [u8; 32];

/// The all-zero hash. Used as the parent of the first block and as the
/// transaction root of an empty block.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Compute the BLAKE3 hash of the input data.
///
/// # Example
///
/// ```
/// use rbft_order::crypto::blake3_hash;
///
/// let hash = blake3_hash(b"order");
/// assert_eq!(hash.len(), 32);
/// ```
pub fn blake3_hash(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Hash multiple byte slices together without concatenating them first.
///
/// The parts are fed into the hasher sequentially, so
/// `blake3_hash_multi(&[a, b])` equals `blake3_hash(&[a, b].concat())`.
pub fn blake3_hash_multi(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Domain-separated BLAKE3 (`derive_key` mode).
///
/// Different contexts yield unrelated outputs for the same input. Signed
/// consensus messages use this so a signature over a message can never be
/// replayed as a signature over some other structure with the same bytes.
pub fn domain_separated_hash(context: &str, data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Compute a binary Merkle root over a list of leaf hashes.
///
/// An odd node at any level is paired with itself. A single leaf is also
/// paired with itself so the root is always a hash output. The empty list
/// yields [`ZERO_HASH`].
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return ZERO_HASH;
    }

    let mut level: Vec<Hash> = leaves.to_vec();
    if level.len() == 1 {
        return blake3_hash_multi(&[level[0].as_slice(), level[0].as_slice()]);
    }

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                blake3_hash_multi(&[left.as_slice(), right.as_slice()])
            })
            .collect();
    }

    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blake3_deterministic() {
        assert_eq!(blake3_hash(b"height 1"), blake3_hash(b"height 1"));
        assert_ne!(blake3_hash(b"height 1"), blake3_hash(b"height 2"));
    }

    #[test]
    fn test_multi_matches_concatenation() {
        let joined = blake3_hash(b"helloworld");
        let parts = blake3_hash_multi(&[b"hello", b"world"]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn test_domain_separation() {
        let a = domain_separated_hash("rbft-order consensus message", b"payload");
        let b = domain_separated_hash("rbft-order block", b"payload");
        assert_ne!(a, b);
        assert_ne!(a, blake3_hash(b"payload"));
    }

    #[test]
    fn test_merkle_root_empty_is_zero() {
        assert_eq!(merkle_root(&[]), ZERO_HASH);
    }

    #[test]
    fn test_merkle_root_single_leaf_is_hashed() {
        let leaf = blake3_hash(b"tx");
        let root = merkle_root(&[leaf]);
        assert_ne!(root, leaf);
        assert_eq!(root, blake3_hash_multi(&[&leaf, &leaf]));
    }

    #[test]
    fn test_merkle_root_order_sensitive() {
        let a = blake3_hash(b"a");
        let b = blake3_hash(b"b");
        let c = blake3_hash(b"c");
        assert_ne!(merkle_root(&[a, b, c]), merkle_root(&[b, a, c]));
    }

    #[test]
    fn test_merkle_root_odd_duplicates_last() {
        let a = blake3_hash(b"a");
        let b = blake3_hash(b"b");
        let c = blake3_hash(b"c");
        let ab = blake3_hash_multi(&[&a, &b]);
        let cc = blake3_hash_multi(&[&c, &c]);
        assert_eq!(merkle_root(&[a, b, c]), blake3_hash_multi(&[&ab, &cc]));
    }
}
