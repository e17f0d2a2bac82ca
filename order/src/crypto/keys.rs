//! # Replica Keys
//!
//! Every replica signs the consensus messages it emits with an Ed25519 key.
//! Peers know each other's public keys from the membership table, so a
//! message claiming to come from replica `n` can be checked against the
//! key registered for `n` before it gets anywhere near the engine.
//!
//! Key bytes are never logged. `Debug` prints the public half only.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Ed25519 signature length in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Ed25519 public key length in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Errors from key parsing and signature checks.
///
/// Deliberately coarse: callers learn that verification failed, not why.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid secret key bytes")]
    InvalidSecretKey,

    #[error("invalid public key bytes")]
    InvalidPublicKey,

    #[error("invalid signature bytes: expected {SIGNATURE_LENGTH} bytes")]
    InvalidSignature,

    #[error("signature verification failed")]
    VerificationFailed,
}

/// A replica's signing keypair.
///
/// Does not implement `Serialize`. Writing a secret key anywhere should be
/// an explicit call to [`secret_key_hex`](Self::secret_key_hex).
pub struct ReplicaKeypair {
    signing_key: SigningKey,
}

impl ReplicaKeypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Parse a hex-encoded 32-byte secret key, as stored in `replica.key`.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; SECRET_KEY_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// Hex of the secret key. Handle with care.
    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// The public half of this keypair.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            bytes: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// Sign `message`, returning the 64 signature bytes.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

impl Clone for ReplicaKeypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.signing_key.to_bytes())
    }
}

impl fmt::Debug for ReplicaKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaKeypair(pub={})", self.public_key().to_hex())
    }
}

/// An Ed25519 public key as it appears in peer descriptors.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    bytes: [u8; PUBLIC_KEY_LENGTH],
}

impl PublicKey {
    /// Parse and validate raw key bytes. Rejects wrong lengths and bytes
    /// that are not a valid curve point.
    pub fn try_from_slice(slice: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; PUBLIC_KEY_LENGTH] =
            slice.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { bytes })
    }

    /// Parse a hex-encoded public key.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| KeyError::InvalidPublicKey)?;
        Self::try_from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Check `signature` over `message`.
    ///
    /// Never panics: malformed signature bytes are an error like any other.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), KeyError> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        let sig_bytes: [u8; SIGNATURE_LENGTH] = signature
            .try_into()
            .map_err(|_| KeyError::InvalidSignature)?;
        verifying_key
            .verify(message, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| KeyError::VerificationFailed)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let kp = ReplicaKeypair::generate();
        let sig = kp.sign(b"prepare");
        assert!(kp.public_key().verify(b"prepare", &sig).is_ok());
    }

    #[test]
    fn test_wrong_message_fails() {
        let kp = ReplicaKeypair::generate();
        let sig = kp.sign(b"prepare");
        assert_eq!(
            kp.public_key().verify(b"commit", &sig),
            Err(KeyError::VerificationFailed)
        );
    }

    #[test]
    fn test_truncated_signature_is_error_not_panic() {
        let kp = ReplicaKeypair::generate();
        let sig = kp.sign(b"prepare");
        assert_eq!(
            kp.public_key().verify(b"prepare", &sig[..10]),
            Err(KeyError::InvalidSignature)
        );
        assert_eq!(
            kp.public_key().verify(b"prepare", &[]),
            Err(KeyError::InvalidSignature)
        );
    }

    #[test]
    fn test_hex_roundtrip_preserves_identity() {
        let kp = ReplicaKeypair::from_seed(&[7u8; 32]);
        let restored = ReplicaKeypair::from_hex(&kp.secret_key_hex()).unwrap();
        assert_eq!(kp.public_key(), restored.public_key());

        let pk = PublicKey::from_hex(&kp.public_key().to_hex()).unwrap();
        assert_eq!(pk, kp.public_key());
    }

    #[test]
    fn test_rejects_malformed_keys() {
        assert!(ReplicaKeypair::from_hex("zz").is_err());
        assert!(ReplicaKeypair::from_hex("abcd").is_err());
        assert!(PublicKey::try_from_slice(&[1u8; 31]).is_err());
        assert!(PublicKey::from_hex("not hex").is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let kp = ReplicaKeypair::from_seed(&[9u8; 32]);
        let dbg = format!("{:?}", kp);
        assert!(!dbg.contains(&kp.secret_key_hex()));
        assert!(dbg.contains(&kp.public_key().to_hex()));
    }
}
