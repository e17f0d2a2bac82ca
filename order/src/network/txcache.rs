//! # Transaction Cache
//!
//! Buffers client transactions and cuts them into [`TxSet`]s for proposal.
//!
//! ```text
//!  submit(tx) ──▶ [ intake queue ] ──▶ worker ──▶ [ batch queue ] ──▶ coordinator
//!                  cache_capacity       Batcher     BATCH_QUEUE_DEPTH
//! ```
//!
//! A set is cut when the first of these holds:
//!
//! 1. the pending count reaches `set_size`;
//! 2. `set_timeout` has passed since the oldest pending transaction arrived;
//! 3. the memory limit is enabled and the next transaction would push the
//!    serialized pending set past `batch_max_mem`.
//!
//! When (1) and (3) trigger on the same arrival, (1) wins: the arriving
//! transaction joins the pending set and the whole set is cut as one.
//!
//! Cuts move the pending vector out, so no transaction is ever in two sets.
//! On shutdown a partial set is dropped. Clients resubmit; the cache is not
//! a durability layer.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::transaction::{Transaction, TxSet};

/// Depth of the queue between the worker and the coordinator.
pub const BATCH_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TxCacheError {
    #[error("transaction cache is full")]
    CacheFull,

    #[error("transaction cache is closed")]
    Closed,

    #[error("transaction cache already started")]
    AlreadyStarted,
}

/// Cut thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub set_size: usize,
    pub set_timeout: Duration,
    /// Serialized-size ceiling for one set, when enabled.
    pub max_mem: Option<u64>,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            set_size: 1000,
            set_timeout: Duration::from_millis(100),
            max_mem: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Batcher
// ---------------------------------------------------------------------------

/// The cut logic, with the clock passed in.
///
/// Owned by the cache worker. Kept free of channels so it can be driven
/// directly from tests and benches.
#[derive(Debug)]
pub struct Batcher {
    policy: BatchPolicy,
    pending: Vec<Transaction>,
    pending_bytes: u64,
    deadline: Option<Instant>,
}

impl Batcher {
    pub fn new(policy: BatchPolicy) -> Self {
        Self {
            policy,
            pending: Vec::new(),
            pending_bytes: 0,
            deadline: None,
        }
    }

    /// Add a transaction. Returns a set when this arrival triggers a cut.
    pub fn push(&mut self, tx: Transaction, now: Instant) -> Option<TxSet> {
        let tx_bytes = tx.encoded_len() as u64;

        if self.pending.len() + 1 >= self.policy.set_size {
            self.append(tx, tx_bytes, now);
            return Some(self.take());
        }

        if let Some(max) = self.policy.max_mem {
            if !self.pending.is_empty() && self.pending_bytes.saturating_add(tx_bytes) > max {
                let cut = self.take();
                self.append(tx, tx_bytes, now);
                return Some(cut);
            }
        }

        self.append(tx, tx_bytes, now);
        None
    }

    /// Cut the pending set if its deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Option<TxSet> {
        match self.deadline {
            Some(deadline) if now >= deadline && !self.pending.is_empty() => Some(self.take()),
            _ => None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop the pending set, returning how many transactions were in it.
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.pending_bytes = 0;
        self.deadline = None;
        dropped
    }

    fn append(&mut self, tx: Transaction, tx_bytes: u64, now: Instant) {
        if self.pending.is_empty() {
            self.deadline = Some(now + self.policy.set_timeout);
        }
        self.pending.push(tx);
        self.pending_bytes = self.pending_bytes.saturating_add(tx_bytes);
    }

    fn take(&mut self) -> TxSet {
        self.pending_bytes = 0;
        self.deadline = None;
        TxSet::local(std::mem::take(&mut self.pending))
    }
}

// ---------------------------------------------------------------------------
// TxCache
// ---------------------------------------------------------------------------

pub struct TxCache {
    policy: BatchPolicy,
    intake: mpsc::Sender<Transaction>,
    intake_rx: Mutex<Option<mpsc::Receiver<Transaction>>>,
    batch_tx: Mutex<Option<mpsc::Sender<TxSet>>>,
    batch_rx: Mutex<Option<mpsc::Receiver<TxSet>>>,
}

impl TxCache {
    /// A cache holding at most `capacity` transactions not yet batched.
    pub fn new(policy: BatchPolicy, capacity: usize) -> Self {
        let (intake, intake_rx) = mpsc::channel(capacity.max(1));
        let (batch_tx, batch_rx) = mpsc::channel(BATCH_QUEUE_DEPTH);
        Self {
            policy,
            intake,
            intake_rx: Mutex::new(Some(intake_rx)),
            batch_tx: Mutex::new(Some(batch_tx)),
            batch_rx: Mutex::new(Some(batch_rx)),
        }
    }

    pub fn policy(&self) -> BatchPolicy {
        self.policy
    }

    /// Enqueue a transaction without waiting.
    ///
    /// `CacheFull` is backpressure: the transaction was not taken and the
    /// caller should retry later or elsewhere.
    pub fn submit(&self, tx: Transaction) -> Result<(), TxCacheError> {
        self.intake.try_send(tx).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TxCacheError::CacheFull,
            mpsc::error::TrySendError::Closed(_) => TxCacheError::Closed,
        })
    }

    /// Whether the intake queue has no free slot.
    pub fn is_full(&self) -> bool {
        self.intake.capacity() == 0
    }

    /// The stream of cut sets. Available once.
    pub fn batches(&self) -> Option<BatchStream> {
        self.batch_rx.lock().take().map(|rx| BatchStream { rx })
    }

    /// Spawn the accumulation worker. It runs until `shutdown` flips to
    /// true, its sender is dropped, or the batch stream is dropped.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>, TxCacheError> {
        let intake = self.intake_rx.lock().take().ok_or(TxCacheError::AlreadyStarted)?;
        let out = self.batch_tx.lock().take().ok_or(TxCacheError::AlreadyStarted)?;
        let batcher = Batcher::new(self.policy);
        Ok(tokio::spawn(run_worker(batcher, intake, out, shutdown)))
    }
}

async fn run_worker(
    mut batcher: Batcher,
    mut intake: mpsc::Receiver<Transaction>,
    out: mpsc::Sender<TxSet>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        set_size = batcher.policy.set_size,
        timeout_ms = batcher.policy.set_timeout.as_millis() as u64,
        "Transaction cache started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let deadline = batcher.deadline();
        let ready = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            received = intake.recv() => match received {
                Some(tx) => batcher.push(tx, Instant::now()),
                None => break,
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                batcher.take_expired(Instant::now())
            }
        };

        if let Some(set) = ready {
            debug!(size = set.len(), "Transaction set cut");
            if out.send(set).await.is_err() {
                break;
            }
        }
    }

    let dropped = batcher.discard();
    info!(dropped, "Transaction cache stopped");
}

/// Sets cut by the cache, in cut order. Ends when the worker exits.
pub struct BatchStream {
    rx: mpsc::Receiver<TxSet>,
}

impl BatchStream {
    pub async fn recv(&mut self) -> Option<TxSet> {
        self.rx.recv().await
    }
}

impl Stream for BatchStream {
    type Item = TxSet;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<TxSet>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(nonce: u64) -> Transaction {
        Transaction::new("alice", nonce, vec![0u8; 32])
    }

    fn policy(set_size: usize) -> BatchPolicy {
        BatchPolicy {
            set_size,
            set_timeout: Duration::from_millis(100),
            max_mem: None,
        }
    }

    fn nonces(set: &TxSet) -> Vec<u64> {
        set.transactions.iter().map(|t| t.nonce).collect()
    }

    // -- Batcher ------------------------------------------------------------

    #[test]
    fn size_cut_includes_arriving_tx() {
        let mut b = Batcher::new(policy(3));
        let now = Instant::now();
        assert!(b.push(tx(1), now).is_none());
        assert!(b.push(tx(2), now).is_none());
        let set = b.push(tx(3), now).unwrap();
        assert_eq!(nonces(&set), vec![1, 2, 3]);
        assert_eq!(set.local_list, vec![true; 3]);
        assert_eq!(b.pending_len(), 0);
        assert!(b.deadline().is_none());
    }

    #[test]
    fn memory_cut_leaves_arriving_tx_pending() {
        let one = tx(1).encoded_len() as u64;
        let mut b = Batcher::new(BatchPolicy {
            max_mem: Some(one * 2),
            ..policy(100)
        });
        let now = Instant::now();
        assert!(b.push(tx(1), now).is_none());
        assert!(b.push(tx(2), now).is_none());
        let set = b.push(tx(3), now).unwrap();
        assert_eq!(nonces(&set), vec![1, 2]);
        assert_eq!(b.pending_len(), 1);
        assert!(b.deadline().is_some());
    }

    #[test]
    fn size_wins_over_memory_on_same_arrival() {
        let one = tx(1).encoded_len() as u64;
        let mut b = Batcher::new(BatchPolicy {
            max_mem: Some(one),
            ..policy(2)
        });
        let now = Instant::now();
        assert!(b.push(tx(1), now).is_none());
        let set = b.push(tx(2), now).unwrap();
        assert_eq!(nonces(&set), vec![1, 2]);
        assert_eq!(b.pending_len(), 0);
    }

    #[test]
    fn deadline_runs_from_first_pending() {
        let mut b = Batcher::new(policy(10));
        let t0 = Instant::now();
        b.push(tx(1), t0);
        b.push(tx(2), t0 + Duration::from_millis(50));
        assert_eq!(b.deadline(), Some(t0 + Duration::from_millis(100)));

        assert!(b.take_expired(t0 + Duration::from_millis(99)).is_none());
        let set = b.take_expired(t0 + Duration::from_millis(100)).unwrap();
        assert_eq!(nonces(&set), vec![1, 2]);
        assert!(b.take_expired(t0 + Duration::from_secs(5)).is_none());
    }

    #[test]
    fn discard_empties_pending() {
        let mut b = Batcher::new(policy(10));
        b.push(tx(1), Instant::now());
        b.push(tx(2), Instant::now());
        assert_eq!(b.discard(), 2);
        assert_eq!(b.pending_len(), 0);
        assert!(b.deadline().is_none());
    }

    // -- TxCache ------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn timeout_emits_single_set_in_order() {
        let cache = TxCache::new(policy(10), 64);
        let mut batches = cache.batches().unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        cache.start(stop_rx).unwrap();

        cache.submit(tx(1)).unwrap();
        cache.submit(tx(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let set = batches.recv().await.unwrap();
        assert_eq!(nonces(&set), vec![1, 2]);

        let next = tokio::time::timeout(Duration::from_secs(1), batches.recv()).await;
        assert!(next.is_err(), "no further set without further submissions");
    }

    #[tokio::test(start_paused = true)]
    async fn sets_partition_submissions() {
        let cache = TxCache::new(policy(4), 64);
        let mut batches = cache.batches().unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        cache.start(stop_rx).unwrap();

        for n in 1..=10 {
            cache.submit(tx(n)).unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 10 {
            let set = batches.recv().await.unwrap();
            assert!(set.len() <= 4);
            seen.extend(nonces(&set));
        }
        assert_eq!(seen, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn full_intake_rejects() {
        let cache = TxCache::new(policy(10), 2);
        cache.submit(tx(1)).unwrap();
        cache.submit(tx(2)).unwrap();
        assert!(cache.is_full());
        assert_eq!(cache.submit(tx(3)), Err(TxCacheError::CacheFull));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_discards_partial_set() {
        let cache = TxCache::new(policy(10), 64);
        let mut batches = cache.batches().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = cache.start(stop_rx).unwrap();

        cache.submit(tx(1)).unwrap();
        tokio::task::yield_now().await;
        stop_tx.send(true).unwrap();
        worker.await.unwrap();

        assert!(batches.recv().await.is_none());
    }

    #[tokio::test]
    async fn start_and_batches_are_single_use() {
        let cache = TxCache::new(policy(10), 8);
        assert!(cache.batches().is_some());
        assert!(cache.batches().is_none());

        let (_stop_tx, stop_rx) = watch::channel(false);
        let _worker = cache.start(stop_rx.clone()).unwrap();
        assert_eq!(cache.start(stop_rx).unwrap_err(), TxCacheError::AlreadyStarted);
    }
}
