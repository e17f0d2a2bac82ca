//! # Consensus Engine Contract
//!
//! The replication engine (leader election, view change, quorum
//! certificates, checkpointing) is not implemented in this crate. It is a
//! collaborator reached through two traits that face each other:
//!
//! ```text
//!   ┌──────────────┐   propose / step / report_*   ┌─────────────────┐
//!   │     Node     │ ────────────────────────────▶ │ ConsensusEngine │
//!   │ (coordinator)│                               │   (black box)   │
//!   └──────────────┘                               └────────┬────────┘
//!          ▲                                                │
//!          │ ready blocks        execute / broadcast /      │
//!          │                     update_table / state_*     ▼
//!   ┌──────┴───────────────────────────────────────────────────────┐
//!   │                     Stack  (impl External)                   │
//!   └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine is constructed by a caller-supplied closure that receives an
//! [`EngineConfig`] whose `external` field is the Stack. That is the only
//! way the engine gets a handle back into the node.
//!
//! The wire types here are what the engine and the node exchange. Their
//! payloads are opaque to this crate and everything is `bincode` encoded.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::ServiceState;
use crate::crypto::hash::domain_separated_hash;
use crate::network::transport::{AuthError, TransportError};
use crate::storage::StorageError;
use crate::transaction::{Transaction, TxSet};

/// Context string for the digest a consensus message signature covers.
const MESSAGE_SIGNING_CONTEXT: &str = "rbft-order 2026 consensus message v1";

// ---------------------------------------------------------------------------
// Engine status
// ---------------------------------------------------------------------------

/// The engine's coarse-grained phase. Only `Normal` accepts new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Normal,
    InViewChange,
    InRecovery,
    InUpdatingN,
    PoolFull,
    StateTransferring,
    Pending,
}

impl Status {
    /// Operator-facing description of the phase.
    pub fn description(&self) -> &'static str {
        match self {
            Status::Normal => "Normal",
            Status::InViewChange => "system is in view change",
            Status::InRecovery => "system is in recovery",
            Status::InUpdatingN => "system is in updatingN",
            Status::PoolFull => "system is too busy",
            Status::StateTransferring => "system is in state update",
            Status::Pending => "system is in pending state",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Status snapshot returned by [`ConsensusEngine::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub status: Status,
    /// Highest height the engine considers executed.
    pub applied: u64,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A consensus protocol message as it travels between replicas.
///
/// `kind` and `payload` belong to the engine. The node only cares about
/// `from` and `signature`, which it checks before the engine sees anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusMessage {
    pub from: u64,
    pub epoch: u64,
    pub kind: u32,
    pub payload: Vec<u8>,
    /// Signature by `from` over [`signing_digest`](Self::signing_digest).
    #[serde(default)]
    pub signature: Vec<u8>,
}

impl ConsensusMessage {
    pub fn new(from: u64, epoch: u64, kind: u32, payload: Vec<u8>) -> Self {
        Self {
            from,
            epoch,
            kind,
            payload,
            signature: Vec::new(),
        }
    }

    /// The 32 bytes a replica signs. Covers every field except the signature.
    pub fn signing_digest(&self) -> [u8; 32] {
        let mut buf = Vec::with_capacity(20 + self.payload.len());
        buf.extend_from_slice(&self.from.to_le_bytes());
        buf.extend_from_slice(&self.epoch.to_le_bytes());
        buf.extend_from_slice(&self.kind.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        domain_separated_hash(MESSAGE_SIGNING_CONTEXT, &buf)
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChangeKind {
    Add,
    Remove,
    Update,
}

impl fmt::Display for ConfChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfChangeKind::Add => write!(f, "add"),
            ConfChangeKind::Remove => write!(f, "remove"),
            ConfChangeKind::Update => write!(f, "update"),
        }
    }
}

/// A membership mutation agreed by the engine.
///
/// `context` is an encoded [`Peer`] for `Add`, an encoded [`Router`] for
/// `Update`, and ignored for `Remove`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfChange {
    pub node_id: u64,
    pub kind: ConfChangeKind,
    #[serde(default)]
    pub context: Vec<u8>,
}

impl ConfChange {
    pub fn remove(node_id: u64) -> Self {
        Self {
            node_id,
            kind: ConfChangeKind::Remove,
            context: Vec::new(),
        }
    }

    pub fn add(peer: &Peer) -> Result<Self, bincode::Error> {
        Ok(Self {
            node_id: peer.id,
            kind: ConfChangeKind::Add,
            context: bincode::serialize(peer)?,
        })
    }

    pub fn update(router: &Router) -> Result<Self, bincode::Error> {
        Ok(Self {
            node_id: 0,
            kind: ConfChangeKind::Update,
            context: bincode::serialize(router)?,
        })
    }
}

/// A replica as the engine sees it: an id and an opaque routing context.
/// The node stores a `PeerInfo` in `context`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: u64,
    pub context: Vec<u8>,
}

/// A full membership list, as carried by `Update` conf changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    pub peers: Vec<Peer>,
}

/// Informational events the engine raises about its own progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterEvent {
    RecoveryFinished { view: u64, height: u64 },
    ViewChangeFinished { view: u64, height: u64 },
    MembershipUpdated { epoch: u64 },
    StateUpdateFinished { height: u64 },
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine is not running")]
    Stopped,

    #[error("engine transaction pool is full")]
    PoolFull,

    #[error("conf change rejected: {0}")]
    ConfChangeRejected(String),

    #[error("engine failure: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// Engine configuration
// ---------------------------------------------------------------------------

/// Timeouts the engine runs its phases against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineTimeouts {
    pub sync_state: Duration,
    pub sync_state_restart: Duration,
    pub recovery: Duration,
    pub first_request: Duration,
    pub batch: Duration,
    pub request: Duration,
    pub null_request: Duration,
    pub new_view: Duration,
    pub resend_viewchange: Duration,
    pub clean_viewchange: Duration,
    pub update: Duration,
    pub set: Duration,
    pub check_pool: Duration,
}

/// Everything the engine needs except the callback surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineParams {
    pub id: u64,
    pub is_new: bool,
    pub applied: u64,
    pub digest: String,
    /// Bootstrap membership, ascending by id.
    pub peers: Vec<Peer>,
    /// Checkpoint period in heights.
    pub k: u64,
    pub log_multiplier: u64,
    pub vc_period: u64,
    pub set_size: usize,
    pub batch_size: u64,
    pub pool_size: u64,
    pub batch_mem_limit: bool,
    pub batch_max_mem: u64,
    pub tolerance_time: Duration,
    pub timeouts: EngineTimeouts,
}

/// What the engine constructor receives.
pub struct EngineConfig {
    pub params: EngineParams,
    pub external: Arc<dyn External>,
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// The replication engine, as driven by the node.
pub trait ConsensusEngine: Send + Sync {
    fn start(&self) -> Result<(), EngineError>;

    fn stop(&self);

    /// Hand a batch to the engine for ordering. Returning `Ok` does not
    /// mean the batch will be ordered.
    fn propose(&self, set: TxSet) -> Result<(), EngineError>;

    /// Feed an authenticated consensus message.
    fn step(&self, msg: ConsensusMessage);

    fn status(&self) -> NodeStatus;

    fn report_executed(&self, state: ServiceState);

    fn report_state_updated(&self, state: ServiceState);

    /// Ask the cluster to agree on a membership change. Returns once
    /// requested; application arrives later through `External::update_table`.
    fn propose_conf_change(&self, change: ConfChange) -> Result<(), EngineError>;

    /// Tell the engine a conf change has been applied node-side.
    fn apply_conf_change(&self, change: &ConfChange);

    /// Next nonce the engine expects from `account`, counting pooled txs.
    fn pending_nonce(&self, account: &str) -> u64;

    /// The engine's own commit quorum, when it exposes one.
    fn quorum(&self) -> Option<u64> {
        None
    }
}

/// The callback surface the engine drives. Implemented by the Stack.
#[async_trait]
pub trait External: Send + Sync {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, AuthError>;

    fn verify(&self, peer_id: u64, signature: &[u8], payload: &[u8]) -> Result<(), AuthError>;

    /// Fire-and-forget to every peer except self.
    async fn broadcast(&self, msg: ConsensusMessage) -> Result<(), TransportError>;

    /// Fire-and-forget to one peer.
    async fn unicast(&self, msg: ConsensusMessage, to: u64) -> Result<(), TransportError>;

    /// Request/response exchange for recovery traffic. Fails once
    /// `timeout` elapses.
    async fn request(
        &self,
        msg: ConsensusMessage,
        to: u64,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Deliver an ordered batch for `height`. Called once per height in
    /// ascending order; resolves once the block is queued for commit.
    async fn execute(
        &self,
        transactions: Vec<Transaction>,
        local_list: Vec<bool>,
        height: u64,
        timestamp: i64,
    );

    fn update_table(&self, change: &ConfChange);

    /// Start catching up to `height` / `digest` using `checkpoints` as sources.
    fn state_update(&self, height: u64, digest: String, checkpoints: Vec<u64>);

    fn send_filter_event(&self, event: FilterEvent);

    fn store_state(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    fn del_state(&self, key: &str) -> Result<(), StorageError>;

    fn read_state(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    fn read_state_set(&self, prefix: &str) -> Result<BTreeMap<String, Vec<u8>>, StorageError>;

    /// Remove every entry under `prefix`.
    fn destroy(&self, prefix: &str) -> Result<(), StorageError>;
}
