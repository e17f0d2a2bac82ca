//! # The Stack
//!
//! The node's implementation of [`External`], the callback surface the
//! engine drives. It owns no thread of its own; every method runs on the
//! engine's task and either finishes inline or hands work off:
//!
//! | Callback            | Goes to                                       |
//! |---------------------|-----------------------------------------------|
//! | `sign` / `verify`   | [`Authenticator`]                             |
//! | `broadcast` / `unicast` / `request` | [`PeerTransport`], signed     |
//! | `execute`           | coordinator, via the bounded ready queue      |
//! | `update_table`      | [`Membership`], then transport and engine     |
//! | `state_update`      | [`StateTracker`] plus a spawned catch-up task |
//! | `send_filter_event` | log line and broadcast channel                |
//! | storage callbacks   | [`StateStore`]                                |
//!
//! `execute` awaits a slot in the ready queue. When the commit consumer
//! falls behind, that await is what slows the engine down.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::block::ServiceState;
use crate::network::engine::{ConfChange, ConsensusEngine, ConsensusMessage, External, FilterEvent};
use crate::network::executor::{ChainHead, ReadyEvent, StateTracker, StateUpdateTarget};
use crate::network::membership::{ApplyOutcome, Membership};
use crate::network::sync::BlockFetcher;
use crate::network::transport::{
    request, AuthError, Authenticator, PeerTransport, TransportError, WireRequest,
};
use crate::storage::{StateStore, StorageError};
use crate::transaction::Transaction;

/// Collaborators and shared state the Stack is built from.
pub(crate) struct StackParts {
    pub id: u64,
    pub membership: Arc<Membership>,
    pub authenticator: Arc<dyn Authenticator>,
    pub transport: Arc<dyn PeerTransport>,
    pub store: Arc<dyn StateStore>,
    pub ready_tx: mpsc::Sender<ReadyEvent>,
    pub tracker: Arc<StateTracker>,
    pub head: Arc<ChainHead>,
    pub fetch_timeout: Duration,
    pub filter_tx: broadcast::Sender<FilterEvent>,
    pub shutdown: Arc<watch::Sender<bool>>,
}

pub struct Stack {
    id: u64,
    membership: Arc<Membership>,
    authenticator: Arc<dyn Authenticator>,
    transport: Arc<dyn PeerTransport>,
    store: Arc<dyn StateStore>,
    ready_tx: mpsc::Sender<ReadyEvent>,
    tracker: Arc<StateTracker>,
    head: Arc<ChainHead>,
    fetch_timeout: Duration,
    filter_tx: broadcast::Sender<FilterEvent>,
    shutdown: Arc<watch::Sender<bool>>,
    engine: RwLock<Option<Weak<dyn ConsensusEngine>>>,
}

impl Stack {
    pub(crate) fn new(parts: StackParts) -> Self {
        Self {
            id: parts.id,
            membership: parts.membership,
            authenticator: parts.authenticator,
            transport: parts.transport,
            store: parts.store,
            ready_tx: parts.ready_tx,
            tracker: parts.tracker,
            head: parts.head,
            fetch_timeout: parts.fetch_timeout,
            filter_tx: parts.filter_tx,
            shutdown: parts.shutdown,
            engine: RwLock::new(None),
        }
    }

    /// Give the Stack a handle back to the engine it serves. Weak, since
    /// the engine holds the Stack.
    pub(crate) fn bind_engine(&self, engine: Weak<dyn ConsensusEngine>) {
        *self.engine.write() = Some(engine);
    }

    fn engine(&self) -> Option<Arc<dyn ConsensusEngine>> {
        self.engine.read().as_ref().and_then(Weak::upgrade)
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn seal(&self, mut msg: ConsensusMessage) -> Result<ConsensusMessage, TransportError> {
        msg.from = self.id;
        msg.signature = self
            .authenticator
            .sign(&msg.signing_digest())
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        Ok(msg)
    }

    fn removed_self(&self, outcome: &ApplyOutcome) -> bool {
        match outcome {
            ApplyOutcome::Removed(id) => *id == self.id,
            ApplyOutcome::Replaced(peers) => peers.iter().all(|p| p.id != self.id),
            ApplyOutcome::Added(_) | ApplyOutcome::Unchanged => false,
        }
    }
}

#[async_trait]
impl External for Stack {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, AuthError> {
        self.authenticator.sign(payload)
    }

    fn verify(&self, peer_id: u64, signature: &[u8], payload: &[u8]) -> Result<(), AuthError> {
        self.authenticator.verify_signature(peer_id, signature, payload)
    }

    async fn broadcast(&self, msg: ConsensusMessage) -> Result<(), TransportError> {
        let bytes = self
            .seal(msg)?
            .encode()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        self.transport.broadcast(bytes).await
    }

    async fn unicast(&self, msg: ConsensusMessage, to: u64) -> Result<(), TransportError> {
        let bytes = self
            .seal(msg)?
            .encode()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        self.transport.unicast(to, bytes).await
    }

    async fn request(
        &self,
        msg: ConsensusMessage,
        to: u64,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let bytes = WireRequest::Consensus(self.seal(msg)?).encode()?;
        request(self.transport.as_ref(), to, bytes, timeout).await
    }

    async fn execute(
        &self,
        transactions: Vec<Transaction>,
        local_list: Vec<bool>,
        height: u64,
        timestamp: i64,
    ) {
        let event = ReadyEvent::Execute {
            transactions,
            local_list,
            height,
            timestamp,
        };
        if self.ready_tx.send(event).await.is_err() {
            if self.stopping() {
                warn!(height, "Ordered height dropped during shutdown");
                return;
            }
            error!(height, "Commit path closed while the node is running");
            panic!("ordered height {height} cannot reach the commit stream");
        }
    }

    fn update_table(&self, change: &ConfChange) {
        let outcome = match self.membership.apply(change) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(node = change.node_id, kind = %change.kind, error = %e, "Conf change not applied");
                return;
            }
        };

        match &outcome {
            ApplyOutcome::Added(peer) => self.transport.add_peer(peer),
            ApplyOutcome::Removed(id) => self.transport.remove_peer(*id),
            ApplyOutcome::Replaced(peers) => self.transport.update_router(peers),
            ApplyOutcome::Unchanged => {}
        }

        if let Some(engine) = self.engine() {
            engine.apply_conf_change(change);
        }

        if self.removed_self(&outcome) {
            warn!(id = self.id, "This replica was removed from the cluster, stopping");
            self.shutdown.send_replace(true);
        }
    }

    fn state_update(&self, height: u64, digest: String, checkpoints: Vec<u64>) {
        let target = StateUpdateTarget {
            height,
            digest,
            checkpoints,
        };
        self.tracker.begin(target.clone());

        let head = self.head.get();
        if head.0 >= target.height {
            self.tracker.clear();
            let state = ServiceState::new(head.0, hex::encode(head.1));
            info!(height = head.0, "Already at state update target");
            if let Some(engine) = self.engine() {
                engine.report_state_updated(state);
            }
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "No runtime to run state update on");
                return;
            }
        };

        let fetcher = BlockFetcher::new(self.id, self.transport.clone(), self.fetch_timeout);
        let sink = self.ready_tx.clone();
        handle.spawn(async move {
            match fetcher.catch_up(head, &target, &sink).await {
                Ok(fetched) => debug!(fetched, target = target.height, "Catch-up delivered"),
                Err(e) => warn!(target = target.height, error = %e, "State update attempt abandoned"),
            }
        });
    }

    fn send_filter_event(&self, event: FilterEvent) {
        info!(event = ?event, "Engine event");
        // No subscribers is fine.
        let _ = self.filter_tx.send(event);
    }

    fn store_state(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.store.store_state(key, value)
    }

    fn del_state(&self, key: &str) -> Result<(), StorageError> {
        self.store.del_state(key)
    }

    fn read_state(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.store.read_state(key)
    }

    fn read_state_set(&self, prefix: &str) -> Result<BTreeMap<String, Vec<u8>>, StorageError> {
        self.store.read_state_set(prefix)
    }

    fn destroy(&self, prefix: &str) -> Result<(), StorageError> {
        self.store.destroy(prefix)
    }
}
