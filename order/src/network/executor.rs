//! # Execution / Commit Adapter
//!
//! Two jobs:
//!
//! - Turn the engine's ordered output for one height into a [`CommitEvent`].
//!   Assembly is a pure function of `(parent, transactions, height,
//!   timestamp)`; the coordinator owns the parent hash and calls it.
//! - Track state transfer. While a [`StateUpdateTarget`] is installed the
//!   node's execution reports are held back from the engine until the
//!   target height is reached, at which point the engine hears
//!   `report_state_updated` exactly once.

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::block::{Block, CommitEvent, ServiceState};
use crate::crypto::hash::Hash;
use crate::transaction::Transaction;

/// Checkpoint heights are logged every this many heights.
pub const CHECKPOINT_LOG_INTERVAL: u64 = 10;

/// What the Stack hands the coordinator for one height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyEvent {
    /// The engine ordered `transactions` at `height`.
    Execute {
        transactions: Vec<Transaction>,
        local_list: Vec<bool>,
        height: u64,
        timestamp: i64,
    },
    /// A block fetched from a peer during state transfer, already verified.
    Synced(Block),
    /// The node reached a state update target by executing elsewhere. The
    /// head moves there without a block on the commit stream.
    Rebased { height: u64, hash: Hash },
}

impl ReadyEvent {
    pub fn height(&self) -> u64 {
        match self {
            ReadyEvent::Execute { height, .. } => *height,
            ReadyEvent::Synced(block) => block.height(),
            ReadyEvent::Rebased { height, .. } => *height,
        }
    }
}

/// Build the commit event for one engine-ordered height.
pub fn assemble(
    parent_hash: Hash,
    transactions: Vec<Transaction>,
    local_list: Vec<bool>,
    height: u64,
    timestamp: i64,
) -> CommitEvent {
    CommitEvent {
        block: Block::new(height, parent_hash, timestamp, transactions),
        local_list,
    }
}

/// Height and hash of the last block pushed onto the commit stream.
///
/// Written only by the coordinator. State transfer reads it to know where
/// to start fetching.
#[derive(Debug)]
pub struct ChainHead {
    inner: RwLock<(u64, Hash)>,
}

impl ChainHead {
    pub fn new(height: u64, hash: Hash) -> Self {
        Self {
            inner: RwLock::new((height, hash)),
        }
    }

    pub fn get(&self) -> (u64, Hash) {
        *self.inner.read()
    }

    pub fn height(&self) -> u64 {
        self.inner.read().0
    }

    pub(crate) fn advance(&self, height: u64, hash: Hash) {
        *self.inner.write() = (height, hash);
    }
}

// ---------------------------------------------------------------------------
// State transfer tracking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdateTarget {
    pub height: u64,
    /// Hex block hash expected at `height`.
    pub digest: String,
    /// Replicas known to hold the checkpoint.
    pub checkpoints: Vec<u64>,
}

/// What the node should tell the engine about one execution report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportAction {
    Executed(ServiceState),
    StateUpdated(ServiceState),
    Ignored,
}

#[derive(Debug, Default)]
struct TrackerState {
    target: Option<StateUpdateTarget>,
    /// Highest height already reported to the engine.
    reported: Option<u64>,
}

#[derive(Debug, Default)]
pub struct StateTracker {
    state: Mutex<TrackerState>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a catch-up target, replacing any earlier one.
    pub fn begin(&self, target: StateUpdateTarget) {
        info!(
            height = target.height,
            digest = %target.digest,
            checkpoints = ?target.checkpoints,
            "State update started"
        );
        self.state.lock().target = Some(target);
    }

    pub fn is_updating(&self) -> bool {
        self.state.lock().target.is_some()
    }

    pub fn target(&self) -> Option<StateUpdateTarget> {
        self.state.lock().target.clone()
    }

    /// Drop the pending target without reporting, e.g. when the node turns
    /// out to be at the target already.
    pub fn clear(&self) -> Option<StateUpdateTarget> {
        self.state.lock().target.take()
    }

    /// Classify a report that `height` has been executed with block `digest`.
    ///
    /// Reports at or below the last forwarded height are stale. While a
    /// target is pending, only the target height with the target digest is
    /// forwarded.
    pub fn on_executed(&self, height: u64, digest: &str) -> ReportAction {
        let mut state = self.state.lock();

        if state.reported.is_some_and(|last| height <= last) {
            debug!(height, "Stale execution report ignored");
            return ReportAction::Ignored;
        }

        let service_state = ServiceState::new(height, digest);

        if let Some(target) = &state.target {
            if target.height != height {
                debug!(height, target = target.height, "Report held back during state update");
                return ReportAction::Ignored;
            }
            if target.digest != digest {
                warn!(
                    height,
                    expected = %target.digest,
                    actual = %digest,
                    "Report at state update target has a different digest, ignored"
                );
                return ReportAction::Ignored;
            }
            state.target = None;
            state.reported = Some(height);
            info!(height, "State update finished");
            return ReportAction::StateUpdated(service_state);
        }

        if height % CHECKPOINT_LOG_INTERVAL == 0 {
            info!(height, "Report checkpoint");
        }
        state.reported = Some(height);
        ReportAction::Executed(service_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::ZERO_HASH;

    fn target(height: u64, digest: &str) -> StateUpdateTarget {
        StateUpdateTarget {
            height,
            digest: digest.into(),
            checkpoints: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_assemble_links_parent() {
        let txs = vec![Transaction::new("alice", 1, vec![]), Transaction::new("alice", 2, vec![])];
        let parent = [3u8; 32];
        let event = assemble(parent, txs.clone(), vec![true, false], 2, 99);
        assert_eq!(event.block.height(), 2);
        assert_eq!(event.block.header.parent_hash, parent);
        assert_eq!(event.block.header.timestamp, 99);
        assert_eq!(event.block.transactions, txs);
        assert_eq!(event.local_list, vec![true, false]);

        assert_eq!(event, assemble(parent, txs, vec![true, false], 2, 99));
    }

    #[test]
    fn test_ready_event_height() {
        let block = Block::new(7, ZERO_HASH, 0, vec![]);
        assert_eq!(ReadyEvent::Synced(block).height(), 7);
        let rebase = ReadyEvent::Rebased {
            height: 9,
            hash: ZERO_HASH,
        };
        assert_eq!(rebase.height(), 9);
    }

    #[test]
    fn test_normal_reports_forwarded() {
        let tracker = StateTracker::new();
        assert_eq!(
            tracker.on_executed(1, "d1"),
            ReportAction::Executed(ServiceState::new(1, "d1"))
        );
        assert_eq!(
            tracker.on_executed(2, "d2"),
            ReportAction::Executed(ServiceState::new(2, "d2"))
        );
    }

    #[test]
    fn test_state_update_completes_once() {
        let tracker = StateTracker::new();
        tracker.begin(target(5, "d5"));
        assert!(tracker.is_updating());

        assert_eq!(
            tracker.on_executed(5, "d5"),
            ReportAction::StateUpdated(ServiceState::new(5, "d5"))
        );
        assert!(!tracker.is_updating());

        assert_eq!(tracker.on_executed(4, "d4"), ReportAction::Ignored);
        assert_eq!(tracker.on_executed(5, "d5"), ReportAction::Ignored);
        assert_eq!(
            tracker.on_executed(6, "d6"),
            ReportAction::Executed(ServiceState::new(6, "d6"))
        );
    }

    #[test]
    fn test_intermediate_heights_held_back() {
        let tracker = StateTracker::new();
        tracker.begin(target(5, "d5"));
        assert_eq!(tracker.on_executed(3, "d3"), ReportAction::Ignored);
        assert_eq!(tracker.on_executed(4, "d4"), ReportAction::Ignored);
        assert_eq!(tracker.on_executed(7, "d7"), ReportAction::Ignored);
        assert!(tracker.is_updating());
    }

    #[test]
    fn test_target_height_with_wrong_digest_held_back() {
        let tracker = StateTracker::new();
        tracker.begin(target(5, "d5"));
        assert_eq!(tracker.on_executed(5, "other"), ReportAction::Ignored);
        assert!(tracker.is_updating());
        assert_eq!(
            tracker.on_executed(5, "d5"),
            ReportAction::StateUpdated(ServiceState::new(5, "d5"))
        );
    }

    #[test]
    fn test_new_target_replaces_old() {
        let tracker = StateTracker::new();
        tracker.begin(target(3, "d3"));
        tracker.begin(target(2, "d2"));
        assert_eq!(tracker.target().unwrap().height, 2);
        assert!(matches!(tracker.on_executed(2, "d2"), ReportAction::StateUpdated(_)));
    }
}
