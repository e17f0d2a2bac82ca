//! # Cryptographic Primitives
//!
//! Thin wrappers over audited crates: BLAKE3 for hashing, Ed25519 for
//! replica signatures. Nothing in here is novel, and it should stay that way.

pub mod hash;
pub mod keys;

pub use hash::{blake3_hash, blake3_hash_multi, domain_separated_hash, merkle_root, Hash, ZERO_HASH};
pub use keys::{KeyError, PublicKey, ReplicaKeypair};
