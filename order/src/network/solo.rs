//! # Solo Engine
//!
//! A single-replica [`ConsensusEngine`]. There is nobody to agree with, so
//! ordering is arrival order:
//!
//! ```text
//! propose(set) ──▶ pool ──▶ (batch_size reached | batch timeout) ──▶ execute(h+1)
//! ```
//!
//! Used for development clusters of one and for exercising the node end to
//! end. Conf changes are applied as soon as they are proposed.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::block::ServiceState;
use crate::network::engine::{
    ConfChange, ConfChangeKind, ConsensusEngine, ConsensusMessage, EngineConfig, EngineError,
    External, FilterEvent, NodeStatus, Router, Status,
};
use crate::network::membership::quorum_for;
use crate::transaction::{Transaction, TxSet};

/// Storage key of the latest checkpointed [`ServiceState`].
pub const CHECKPOINT_KEY: &str = "solo.checkpoint";

struct Pool {
    entries: VecDeque<(Transaction, bool)>,
    /// When the oldest entry arrived.
    since: Option<Instant>,
    /// Last height handed to `execute`.
    ordered: u64,
    /// Last height reported executed.
    applied: u64,
    members: BTreeSet<u64>,
    epoch: u64,
}

struct Inner {
    id: u64,
    batch_size: usize,
    pool_size: usize,
    batch_timeout: Duration,
    checkpoint_period: u64,
    external: Arc<dyn External>,
    pool: Mutex<Pool>,
    /// Next nonce per account, counting everything proposed.
    nonces: DashMap<String, u64>,
    wake: Notify,
}

pub struct SoloEngine {
    inner: Arc<Inner>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SoloEngine {
    pub fn new(config: EngineConfig) -> Self {
        let params = config.params;
        match config.external.read_state(CHECKPOINT_KEY) {
            Ok(Some(bytes)) => match bincode::deserialize::<ServiceState>(&bytes) {
                Ok(state) => info!(height = state.applied, digest = %state.digest, "Found stored checkpoint"),
                Err(e) => warn!(error = %e, "Stored checkpoint is unreadable"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Cannot read stored checkpoint"),
        }

        let inner = Inner {
            id: params.id,
            batch_size: params.batch_size.max(1) as usize,
            pool_size: params.pool_size.max(1) as usize,
            batch_timeout: params.timeouts.batch,
            checkpoint_period: params.k.max(1),
            external: config.external,
            pool: Mutex::new(Pool {
                entries: VecDeque::new(),
                since: None,
                ordered: params.applied,
                applied: params.applied,
                members: params.peers.iter().map(|p| p.id).collect(),
                epoch: 0,
            }),
            nonces: DashMap::new(),
            wake: Notify::new(),
        };

        Self {
            inner: Arc::new(inner),
            stop_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Boxed constructor matching the node's engine builder.
    pub fn build(config: EngineConfig) -> Result<Arc<dyn ConsensusEngine>, EngineError> {
        Ok(Arc::new(Self::new(config)))
    }

    fn running(&self) -> bool {
        self.stop_tx.lock().as_ref().is_some_and(|tx| !*tx.borrow())
    }
}

impl ConsensusEngine for SoloEngine {
    fn start(&self) -> Result<(), EngineError> {
        let mut stop_tx = self.stop_tx.lock();
        if stop_tx.is_some() {
            return Err(EngineError::Internal("solo engine already started".into()));
        }
        let (tx, rx) = watch::channel(false);
        *stop_tx = Some(tx);
        *self.task.lock() = Some(tokio::spawn(run(self.inner.clone(), rx)));
        info!(id = self.inner.id, batch_size = self.inner.batch_size, "Solo engine started");
        Ok(())
    }

    fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().as_ref() {
            if !tx.send_replace(true) {
                info!(id = self.inner.id, "Solo engine stopped");
            }
        }
    }

    fn propose(&self, set: TxSet) -> Result<(), EngineError> {
        if !self.running() {
            return Err(EngineError::Stopped);
        }
        let mut pool = self.inner.pool.lock();
        if pool.entries.len() + set.len() > self.inner.pool_size {
            return Err(EngineError::PoolFull);
        }

        let TxSet {
            transactions,
            local_list,
        } = set;
        for (i, tx) in transactions.into_iter().enumerate() {
            let mut next = self.inner.nonces.entry(tx.from.clone()).or_insert(1);
            *next = (*next).max(tx.nonce.saturating_add(1));
            drop(next);
            pool.entries.push_back((tx, local_list.get(i).copied().unwrap_or(false)));
        }
        if pool.since.is_none() && !pool.entries.is_empty() {
            pool.since = Some(Instant::now());
        }
        drop(pool);

        self.inner.wake.notify_one();
        Ok(())
    }

    fn step(&self, msg: ConsensusMessage) {
        debug!(from = msg.from, kind = msg.kind, "Solo engine ignores consensus traffic");
    }

    fn status(&self) -> NodeStatus {
        let pool = self.inner.pool.lock();
        let status = if !self.running() {
            Status::Pending
        } else if pool.entries.len() >= self.inner.pool_size {
            Status::PoolFull
        } else {
            Status::Normal
        };
        NodeStatus {
            status,
            applied: pool.applied,
        }
    }

    fn report_executed(&self, state: ServiceState) {
        self.inner.pool.lock().applied = state.applied;
        if state.applied == 0 || state.applied % self.inner.checkpoint_period != 0 {
            return;
        }
        match bincode::serialize(&state) {
            Ok(bytes) => {
                if let Err(e) = self.inner.external.store_state(CHECKPOINT_KEY, &bytes) {
                    warn!(height = state.applied, error = %e, "Checkpoint not stored");
                }
            }
            Err(e) => warn!(height = state.applied, error = %e, "Checkpoint not encodable"),
        }
    }

    fn report_state_updated(&self, state: ServiceState) {
        {
            let mut pool = self.inner.pool.lock();
            pool.applied = state.applied;
            pool.ordered = pool.ordered.max(state.applied);
        }
        self.inner
            .external
            .send_filter_event(FilterEvent::StateUpdateFinished { height: state.applied });
    }

    fn propose_conf_change(&self, change: ConfChange) -> Result<(), EngineError> {
        if !self.running() {
            return Err(EngineError::Stopped);
        }
        if change.kind == ConfChangeKind::Update
            && bincode::deserialize::<Router>(&change.context).is_err()
        {
            return Err(EngineError::ConfChangeRejected("undecodable router".into()));
        }
        // Nobody to agree with: apply now.
        self.inner.external.update_table(&change);
        Ok(())
    }

    fn apply_conf_change(&self, change: &ConfChange) {
        let epoch = {
            let mut pool = self.inner.pool.lock();
            match change.kind {
                ConfChangeKind::Add => {
                    pool.members.insert(change.node_id);
                }
                ConfChangeKind::Remove => {
                    pool.members.remove(&change.node_id);
                }
                ConfChangeKind::Update => match bincode::deserialize::<Router>(&change.context) {
                    Ok(router) => pool.members = router.peers.iter().map(|p| p.id).collect(),
                    Err(e) => {
                        warn!(error = %e, "Applied router is undecodable");
                        return;
                    }
                },
            }
            pool.epoch += 1;
            pool.epoch
        };
        self.inner
            .external
            .send_filter_event(FilterEvent::MembershipUpdated { epoch });
    }

    fn pending_nonce(&self, account: &str) -> u64 {
        self.inner.nonces.get(account).map(|n| *n).unwrap_or(1)
    }

    fn quorum(&self) -> Option<u64> {
        Some(quorum_for(self.inner.pool.lock().members.len() as u64))
    }
}

impl Drop for SoloEngine {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.lock().as_ref() {
            tx.send_replace(true);
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// Next batch to order: at most `batch_size` entries and the height it
/// goes at.
fn cut(inner: &Inner) -> Option<(Vec<Transaction>, Vec<bool>, u64)> {
    let mut pool = inner.pool.lock();
    if pool.entries.is_empty() {
        pool.since = None;
        return None;
    }
    let take = pool.entries.len().min(inner.batch_size);
    let (transactions, local_list): (Vec<_>, Vec<_>) = pool.entries.drain(..take).unzip();
    pool.since = if pool.entries.is_empty() {
        None
    } else {
        Some(Instant::now())
    };
    pool.ordered += 1;
    Some((transactions, local_list, pool.ordered))
}

async fn run(inner: Arc<Inner>, mut stop: watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            break;
        }

        let (full, deadline) = {
            let pool = inner.pool.lock();
            (
                pool.entries.len() >= inner.batch_size,
                pool.since.map(|t| t + inner.batch_timeout),
            )
        };

        if !full {
            let expired = tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    false
                }
                _ = inner.wake.notified() => false,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => true,
            };
            if !expired {
                continue;
            }
        }

        if let Some((transactions, local_list, height)) = cut(&inner) {
            let timestamp = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
            debug!(height, txs = transactions.len(), "Solo engine ordered batch");
            inner
                .external
                .execute(transactions, local_list, height, timestamp)
                .await;
        }
    }
    debug!(id = inner.id, "Solo engine loop exited");
}
