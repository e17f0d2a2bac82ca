//! # Node Coordinator
//!
//! The `Node` is what the rest of the process talks to. It owns the engine
//! handle, the transaction cache, and the single event loop that is the
//! only caller of `propose` and the only writer of the commit stream.
//!
//! ```text
//!                 prepare(tx)                         step(bytes)
//!                     │                                   │ verify
//!                     ▼                                   ▼
//!               ┌───────────┐   TxSet   ┌────────────┐  ┌────────┐
//!               │  TxCache  │──────────▶│ event loop │─▶│ engine │
//!               └───────────┘           │            │  └───┬────┘
//!                                       │            │      │ execute
//!                     commit() ◀────────│            │◀─────┘ (Stack)
//!                                       └────────────┘
//! ```
//!
//! Lifecycle:
//!
//! ```text
//! new() ─▶ Stopped ─▶ start() ─▶ Starting ─▶ Running ─▶ stop() ─▶ Stopping ─▶ Stopped
//! ```
//!
//! A node runs once. Its channels are consumed by the first `start()`.
//!
//! The loop services ready blocks, cut batches and cancellation with no
//! priority between them. A block at any height other than head + 1, a
//! commit consumer that disappears while running, and a quorum that
//! disagrees with the engine's are invariant violations and panic.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::block::{CommitEvent, ServiceState};
use crate::config::{ConfigError, OrderConfig};
use crate::crypto::hash::Hash;
use crate::crypto::keys::ReplicaKeypair;
use crate::network::engine::{
    ConfChange, ConsensusEngine, ConsensusMessage, EngineConfig, EngineError, External, FilterEvent,
    NodeStatus, Status,
};
use crate::network::executor::{assemble, ChainHead, ReadyEvent, ReportAction, StateTracker};
use crate::network::membership::{Membership, MembershipError, PeerInfo};
use crate::network::stack::{Stack, StackParts};
use crate::network::transport::{AuthError, Authenticator, Ed25519Authenticator, PeerTransport};
use crate::network::txcache::{BatchStream, TxCache, TxCacheError};
use crate::storage::StateStore;
use crate::transaction::{Transaction, TxSet};

/// Blocks buffered between the loop and the commit consumer.
pub const COMMIT_QUEUE_DEPTH: usize = 1024;

/// Ordered heights buffered between the Stack and the loop.
pub const READY_QUEUE_DEPTH: usize = 16;

const FILTER_CHANNEL_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Stopped => "stopped",
            Lifecycle::Starting => "starting",
            Lifecycle::Running => "running",
            Lifecycle::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors on the node's public surface.
///
/// `NotReady`, `Busy` and `Cache(CacheFull)` are backpressure: retry later.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("{0}")]
    NotReady(Status),

    #[error("transaction cache is full, transaction dropped")]
    Busy,

    #[error("node is {0}")]
    Lifecycle(Lifecycle),

    #[error("node has already run and cannot be restarted")]
    Exhausted,

    #[error(transparent)]
    Cache(#[from] TxCacheError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Membership(#[from] MembershipError),

    #[error("unauthenticated message: {0}")]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("wire codec error: {0}")]
    Codec(#[from] bincode::Error),
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Receiving half of the loop's channels, held until `start()`.
struct Pending {
    ready_rx: mpsc::Receiver<ReadyEvent>,
    commit_tx: mpsc::Sender<CommitEvent>,
}

pub struct Node {
    id: u64,
    engine: Arc<dyn ConsensusEngine>,
    membership: Arc<Membership>,
    authenticator: Arc<dyn Authenticator>,
    cache: TxCache,
    tracker: Arc<StateTracker>,
    head: Arc<ChainHead>,
    ready_tx: mpsc::Sender<ReadyEvent>,
    pending: Mutex<Option<Pending>>,
    commit_rx: Mutex<Option<mpsc::Receiver<CommitEvent>>>,
    filter_tx: broadcast::Sender<FilterEvent>,
    shutdown: Arc<watch::Sender<bool>>,
    lifecycle: Arc<RwLock<Lifecycle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Wire up a node and build its engine.
    ///
    /// `build_engine` receives the engine configuration with the node's
    /// Stack as `external`. The engine is told the configured
    /// `(applied, digest)` before this returns.
    pub fn new<F>(
        config: &OrderConfig,
        keypair: ReplicaKeypair,
        transport: Arc<dyn PeerTransport>,
        store: Arc<dyn StateStore>,
        build_engine: F,
    ) -> Result<Self, OrderError>
    where
        F: FnOnce(EngineConfig) -> Result<Arc<dyn ConsensusEngine>, EngineError>,
    {
        config.validate()?;
        let id = config.id;

        let membership = Arc::new(Membership::new(
            id,
            config.rbft.min_replicas,
            config.peer_infos()?,
        ));
        transport.update_router(&membership.snapshot());
        let authenticator: Arc<dyn Authenticator> =
            Arc::new(Ed25519Authenticator::new(keypair, membership.clone()));

        let (ready_tx, ready_rx) = mpsc::channel(READY_QUEUE_DEPTH);
        let (commit_tx, commit_rx) = mpsc::channel(COMMIT_QUEUE_DEPTH);
        let (filter_tx, _) = broadcast::channel(FILTER_CHANNEL_DEPTH);
        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);

        let head = Arc::new(ChainHead::new(config.applied, config.head_hash()?));
        let tracker = Arc::new(StateTracker::new());

        let stack = Arc::new(Stack::new(StackParts {
            id,
            membership: membership.clone(),
            authenticator: authenticator.clone(),
            transport,
            store,
            ready_tx: ready_tx.clone(),
            tracker: tracker.clone(),
            head: head.clone(),
            fetch_timeout: config.fetch_timeout(),
            filter_tx: filter_tx.clone(),
            shutdown: shutdown.clone(),
        }));

        let external: Arc<dyn External> = stack.clone();
        let engine = build_engine(config.engine_config(external)?)?;
        stack.bind_engine(Arc::downgrade(&engine));

        engine.report_executed(ServiceState::new(config.applied, config.digest.clone()));

        info!(
            id,
            peers = membership.len(),
            quorum = membership.quorum(),
            applied = config.applied,
            "Order node created"
        );

        Ok(Self {
            id,
            engine,
            membership,
            authenticator,
            cache: TxCache::new(config.cache_policy(), config.rbft.cache_capacity),
            tracker,
            head,
            ready_tx,
            pending: Mutex::new(Some(Pending {
                ready_rx,
                commit_tx,
            })),
            commit_rx: Mutex::new(Some(commit_rx)),
            filter_tx,
            shutdown,
            lifecycle: Arc::new(RwLock::new(Lifecycle::Stopped)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> Lifecycle {
        *self.lifecycle.read()
    }

    /// Start the cache worker and the event loop, then the engine.
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), OrderError> {
        {
            let mut state = self.lifecycle.write();
            if *state != Lifecycle::Stopped {
                return Err(OrderError::Lifecycle(*state));
            }
            *state = Lifecycle::Starting;
        }

        match self.launch() {
            Ok(()) => {
                *self.lifecycle.write() = Lifecycle::Running;
                info!(id = self.id, "Order node started");
                Ok(())
            }
            Err(e) => {
                self.shutdown.send_replace(true);
                *self.lifecycle.write() = Lifecycle::Stopped;
                error!(id = self.id, error = %e, "Order node failed to start");
                Err(e)
            }
        }
    }

    fn launch(&self) -> Result<(), OrderError> {
        let Pending {
            ready_rx,
            commit_tx,
        } = self.pending.lock().take().ok_or(OrderError::Exhausted)?;
        let batches = self.cache.batches().ok_or(OrderError::Exhausted)?;

        let worker = self.cache.start(self.shutdown.subscribe())?;
        let event_loop = EventLoop {
            engine: self.engine.clone(),
            head: self.head.clone(),
            ready_rx,
            batches,
            commit_tx,
            shutdown: self.shutdown.subscribe(),
            lifecycle: self.lifecycle.clone(),
        };
        let looper = tokio::spawn(event_loop.run());
        self.tasks.lock().extend([worker, looper]);

        self.engine.start()?;
        Ok(())
    }

    /// Signal cancellation and stop the engine. Idempotent.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        if wind_down(&self.lifecycle, self.engine.as_ref()) {
            info!(id = self.id, "Order node stopped");
        }
    }

    /// Wait for the loop and cache worker to exit after `stop()`.
    pub async fn join(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Node task ended abnormally");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Public surface
    // -----------------------------------------------------------------------

    /// `Ok` only while running with the engine in `Normal`.
    pub fn ready(&self) -> Result<(), OrderError> {
        let state = self.state();
        if state != Lifecycle::Running {
            return Err(OrderError::Lifecycle(state));
        }
        match self.engine.status().status {
            Status::Normal => Ok(()),
            other => Err(OrderError::NotReady(other)),
        }
    }

    /// Submit a transaction for ordering.
    pub fn prepare(&self, tx: Transaction) -> Result<(), OrderError> {
        self.ready()?;
        if self.cache.is_full() && self.engine.status().status == Status::PoolFull {
            return Err(OrderError::Busy);
        }
        self.cache.submit(tx)?;
        Ok(())
    }

    /// The commit stream. Available once.
    pub fn commit(&self) -> Option<CommitStream> {
        self.commit_rx.lock().take().map(|rx| CommitStream { rx })
    }

    /// Feed a wire-encoded consensus message from a peer. Messages that do
    /// not decode or do not verify never reach the engine.
    pub fn step(&self, bytes: &[u8]) -> Result<(), OrderError> {
        let msg = ConsensusMessage::decode(bytes).map_err(|e| {
            warn!(len = bytes.len(), error = %e, "Dropping undecodable consensus message");
            e
        })?;

        if let Err(e) =
            self.authenticator
                .verify_signature(msg.from, &msg.signature, &msg.signing_digest())
        {
            warn!(from = msg.from, error = %e, "Dropping unauthenticated consensus message");
            return Err(e.into());
        }

        self.engine.step(msg);
        Ok(())
    }

    /// Commit quorum for the current membership.
    pub fn quorum(&self) -> u64 {
        let quorum = self.membership.quorum();
        if let Some(engine_quorum) = self.engine.quorum() {
            if engine_quorum != quorum {
                error!(
                    node = quorum,
                    engine = engine_quorum,
                    members = self.membership.len(),
                    "Quorum diverges from the engine"
                );
                panic!("quorum mismatch: node computes {quorum}, engine uses {engine_quorum}");
            }
        }
        quorum
    }

    /// The rest of the node has durably executed `height`, whose block
    /// hashes to `hash`.
    pub fn report_state(&self, height: u64, hash: &Hash, tx_hashes: &[Hash]) {
        debug!(height, txs = tx_hashes.len(), "Execution reported");
        match self.tracker.on_executed(height, &hex::encode(hash)) {
            ReportAction::Executed(state) => self.engine.report_executed(state),
            ReportAction::StateUpdated(state) => self.finish_state_update(height, *hash, state),
            ReportAction::Ignored => {}
        }
    }

    /// Move the loop's head to the state update target, then let the engine
    /// resume. The rebase is queued ahead of anything the engine orders
    /// above the target.
    fn finish_state_update(&self, height: u64, hash: Hash, state: ServiceState) {
        let rebase = ReadyEvent::Rebased { height, hash };
        match self.ready_tx.try_send(rebase) {
            Ok(()) => self.engine.report_state_updated(state),
            Err(mpsc::error::TrySendError::Full(rebase)) => {
                let ready_tx = self.ready_tx.clone();
                let engine = self.engine.clone();
                tokio::spawn(async move {
                    if ready_tx.send(rebase).await.is_ok() {
                        engine.report_state_updated(state);
                    } else {
                        warn!(height, "Event loop gone before state update finished");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(height, "Event loop gone before state update finished");
            }
        }
    }

    /// Ask the cluster to remove `id`. Returns once requested.
    pub fn remove_node(&self, id: u64) -> Result<(), OrderError> {
        self.membership.check_removal(id)?;
        self.engine.propose_conf_change(ConfChange::remove(id))?;
        info!(node = id, "Removal proposed");
        Ok(())
    }

    /// Ask the cluster to admit `peer`. Returns once requested.
    pub fn add_node(&self, peer: &PeerInfo) -> Result<(), OrderError> {
        if self.membership.contains(peer.id) {
            return Err(MembershipError::DuplicatePeer(peer.id).into());
        }
        let change = ConfChange::add(&peer.to_peer()?)?;
        self.engine.propose_conf_change(change)?;
        info!(node = peer.id, "Addition proposed");
        Ok(())
    }

    pub fn pending_nonce(&self, account: &str) -> u64 {
        self.engine.pending_nonce(account)
    }

    pub fn filter_events(&self) -> broadcast::Receiver<FilterEvent> {
        self.filter_tx.subscribe()
    }

    pub fn status(&self) -> NodeStatus {
        self.engine.status()
    }

    /// Height and hash of the last block on the commit stream.
    pub fn head(&self) -> (u64, Hash) {
        self.head.get()
    }

    pub fn committed_height(&self) -> u64 {
        self.head.height()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.membership.snapshot()
    }

    pub fn is_state_updating(&self) -> bool {
        self.tracker.is_updating()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Move to `Stopped` through `Stopping`, stopping the engine on the way.
/// Returns false when another caller already did.
fn wind_down(lifecycle: &RwLock<Lifecycle>, engine: &dyn ConsensusEngine) -> bool {
    {
        let mut state = lifecycle.write();
        if matches!(*state, Lifecycle::Stopped | Lifecycle::Stopping) {
            return false;
        }
        *state = Lifecycle::Stopping;
    }
    engine.stop();
    *lifecycle.write() = Lifecycle::Stopped;
    true
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

struct EventLoop {
    engine: Arc<dyn ConsensusEngine>,
    head: Arc<ChainHead>,
    ready_rx: mpsc::Receiver<ReadyEvent>,
    batches: BatchStream,
    commit_tx: mpsc::Sender<CommitEvent>,
    shutdown: watch::Receiver<bool>,
    lifecycle: Arc<RwLock<Lifecycle>>,
}

impl EventLoop {
    async fn run(mut self) {
        debug!("Event loop started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(event) = self.ready_rx.recv() => self.commit(event).await,
                Some(set) = self.batches.recv() => self.propose(set),
            }
        }

        // Cancellation may have come from the Stack, e.g. on self-removal.
        if wind_down(&self.lifecycle, self.engine.as_ref()) {
            info!("Order node stopped from within");
        }
        debug!("Event loop exited");
    }

    fn propose(&self, set: TxSet) {
        let size = set.len();
        if let Err(e) = self.engine.propose(set) {
            warn!(size, error = %e, "Proposal not accepted");
        }
    }

    async fn commit(&mut self, event: ReadyEvent) {
        let (head_height, parent) = self.head.get();
        let height = event.height();

        let commit = match event {
            ReadyEvent::Execute {
                transactions,
                local_list,
                height,
                timestamp,
            } => {
                if height != head_height + 1 {
                    error!(height, head = head_height, "Engine ordered a height out of sequence");
                    panic!("commit stream would skip from {head_height} to {height}");
                }
                assemble(parent, transactions, local_list, height, timestamp)
            }
            ReadyEvent::Rebased { hash, .. } => {
                if height > head_height {
                    info!(from = head_height, to = height, "Head moved to state update target");
                    self.head.advance(height, hash);
                }
                return;
            }
            ReadyEvent::Synced(block) => {
                if height <= head_height {
                    debug!(height, head = head_height, "Synced block already committed");
                    return;
                }
                if height != head_height + 1 || block.header.parent_hash != parent {
                    warn!(height, head = head_height, "Synced block does not extend the head, dropped");
                    return;
                }
                let local_list = vec![false; block.transactions.len()];
                CommitEvent { block, local_list }
            }
        };

        let hash = commit.block.hash();
        let txs = commit.block.transactions.len();

        let sent = tokio::select! {
            sent = self.commit_tx.send(commit) => sent.is_ok(),
            _ = self.shutdown.changed() => {
                warn!(height, "Commit abandoned during shutdown");
                return;
            }
        };
        if !sent {
            if *self.shutdown.borrow() {
                warn!(height, "Commit consumer gone during shutdown");
                return;
            }
            error!(height, "Commit stream consumer is gone");
            panic!("block {height} cannot be delivered on the commit stream");
        }

        self.head.advance(height, hash);
        debug!(height, txs, "Block committed");
    }
}

// ---------------------------------------------------------------------------
// Commit stream
// ---------------------------------------------------------------------------

/// Committed blocks in strictly increasing height order. Ends when the
/// node stops.
pub struct CommitStream {
    rx: mpsc::Receiver<CommitEvent>,
}

impl CommitStream {
    pub async fn recv(&mut self) -> Option<CommitEvent> {
        self.rx.recv().await
    }
}

impl Stream for CommitStream {
    type Item = CommitEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<CommitEvent>> {
        self.rx.poll_recv(cx)
    }
}
