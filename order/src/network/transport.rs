//! # Network Adapter
//!
//! Two narrow collaborator seams and the glue around them:
//!
//! - [`PeerTransport`] moves bytes between replicas. Connection management,
//!   retries, and framing are its business. `broadcast` and `unicast` are
//!   fire-and-forget; `send` is a request/response exchange.
//! - [`Authenticator`] signs outbound payloads and checks inbound ones
//!   against the key registered for the claimed sender.
//!
//! [`request`] is the only call in the ordering layer with an explicit
//! timeout. Recovery traffic uses it so an unresponsive peer costs a bounded
//! wait instead of a stuck catch-up task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::keys::ReplicaKeypair;
use crate::network::engine::ConsensusMessage;
use crate::network::membership::{Membership, PeerInfo};
use crate::network::sync::SyncRequest;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    PeerUnreachable(u64),

    #[error("request to peer {peer} timed out after {timeout_ms}ms")]
    Timeout { peer: u64, timeout_ms: u64 },

    #[error("message encoding failed: {0}")]
    Encode(String),

    #[error("transport failure: {0}")]
    Io(String),

    #[error("transport is shutting down")]
    Shutdown,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication failure: no key registered for peer {0}")]
    UnknownPeer(u64),

    #[error("authentication failure: bad signature from peer {0}")]
    BadSignature(u64),

    #[error("signing failed: {0}")]
    Signing(String),
}

/// Framing for the `send` path, which carries two kinds of traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireRequest {
    /// An engine recovery exchange.
    Consensus(ConsensusMessage),
    /// A state-transfer fetch.
    Sync(SyncRequest),
}

impl WireRequest {
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        bincode::serialize(self).map_err(|e| TransportError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        bincode::deserialize(bytes).map_err(|e| TransportError::Encode(e.to_string()))
    }
}

/// Byte transport between replicas.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn broadcast(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    async fn unicast(&self, to: u64, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Send a request and wait for the peer's reply. May wait forever;
    /// callers bound it with [`request`].
    async fn send(&self, to: u64, bytes: Vec<u8>) -> Result<Vec<u8>, TransportError>;

    /// Peers the transport can currently reach.
    fn peers(&self) -> Vec<u64>;

    fn add_peer(&self, peer: &PeerInfo);

    fn remove_peer(&self, id: u64);

    /// Replace the whole routing table.
    fn update_router(&self, peers: &[PeerInfo]);
}

/// Signing and verification of replica payloads.
pub trait Authenticator: Send + Sync {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, AuthError>;

    /// Never panics, whatever the bytes.
    fn verify_signature(&self, peer_id: u64, signature: &[u8], payload: &[u8])
        -> Result<(), AuthError>;
}

/// Request/response over `transport`, failing after `timeout`.
pub async fn request(
    transport: &dyn PeerTransport,
    to: u64,
    bytes: Vec<u8>,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    match tokio::time::timeout(timeout, transport.send(to, bytes)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            peer: to,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

// ---------------------------------------------------------------------------
// Ed25519 authenticator
// ---------------------------------------------------------------------------

/// Signs with this replica's key and verifies against the public keys in
/// the membership table, so a removed replica's messages stop verifying as
/// soon as the removal is applied.
pub struct Ed25519Authenticator {
    keypair: ReplicaKeypair,
    membership: Arc<Membership>,
}

impl Ed25519Authenticator {
    pub fn new(keypair: ReplicaKeypair, membership: Arc<Membership>) -> Self {
        Self {
            keypair,
            membership,
        }
    }
}

impl Authenticator for Ed25519Authenticator {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, AuthError> {
        Ok(self.keypair.sign(payload))
    }

    fn verify_signature(
        &self,
        peer_id: u64,
        signature: &[u8],
        payload: &[u8],
    ) -> Result<(), AuthError> {
        let key = self
            .membership
            .public_key(peer_id)
            .ok_or(AuthError::UnknownPeer(peer_id))?;
        key.verify(payload, signature)
            .map_err(|_| AuthError::BadSignature(peer_id))
    }
}
