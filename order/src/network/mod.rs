//! # Network Module
//!
//! Everything between the untrusted network, the replication engine and
//! the commit stream.
//!
//! ## Architecture
//!
//! ```text
//! engine.rs     — Engine contract (ConsensusEngine, External) and wire types
//! txcache.rs    — Transaction cache: intake buffering and set cutting
//! membership.rs — Membership table, conf change application, quorum
//! executor.rs   — Block assembly and state update tracking
//! transport.rs  — Peer transport and signature collaborators
//! sync.rs       — Block fetch for state transfer
//! stack.rs      — The Stack: the node's implementation of External
//! node.rs       — Node coordinator and its event loop
//! solo.rs       — Single-replica engine
//! memory.rs     — In-process transport
//! ```
//!
//! ## Design Decisions
//!
//! - The coordinator's event loop is the only writer of the commit stream
//!   and the only caller of `propose`. Blocks fetched by state transfer
//!   are routed through it as well rather than written directly.
//! - The Stack holds the engine weakly. The engine owns the Stack through
//!   its `EngineConfig`, so a strong handle back would leak both.
//! - Membership reads take a `parking_lot::RwLock` read guard and copy out.
//!   Writes only come from the engine's conf change path.
//! - Backpressure runs end to end: a slow commit consumer fills the commit
//!   queue, the loop blocks, the ready queue fills, and `execute` stops
//!   returning to the engine.

pub mod engine;
pub mod executor;
pub mod membership;
pub mod memory;
pub mod node;
pub mod solo;
pub mod stack;
pub mod sync;
pub mod transport;
pub mod txcache;

pub use engine::{
    ConfChange, ConfChangeKind, ConsensusEngine, ConsensusMessage, EngineConfig, EngineError,
    EngineParams, External, FilterEvent, NodeStatus, Peer, Router, Status,
};
pub use executor::{ReadyEvent, ReportAction, StateTracker, StateUpdateTarget};
pub use membership::{quorum_for, ApplyOutcome, Membership, MembershipError, PeerInfo};
pub use memory::{MemoryTransport, Outbound};
pub use node::{CommitStream, Lifecycle, Node, OrderError};
pub use solo::SoloEngine;
pub use stack::Stack;
pub use sync::{handle_sync_request, BlockFetcher, BlockSource, SyncError, SyncRequest, SyncResponse};
pub use transport::{AuthError, Authenticator, Ed25519Authenticator, PeerTransport, TransportError};
pub use txcache::{BatchPolicy, BatchStream, Batcher, TxCache, TxCacheError};
