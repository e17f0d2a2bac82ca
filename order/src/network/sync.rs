//! # State Transfer
//!
//! When the engine decides this replica has fallen behind a stable
//! checkpoint it calls `state_update(height, digest, checkpoints)`. The
//! replica then needs the blocks between its own head and that height.
//!
//! ## Protocol
//!
//! ```text
//! lagging replica                         checkpoint replica
//!       │                                         │
//!       │── WireRequest::Sync(GetBlock{h}) ──────▶│
//!       │◀──────────── SyncResponse::Block ───────│  (or NotFound)
//!       │                                         │
//!   (next height, or the next checkpoint replica on failure)
//! ```
//!
//! Blocks are fetched in windows of [`SYNC_WINDOW`] heights. A window is
//! released only once every block in it links to the one before, starting
//! from our head. The final window must also end in a block whose hash is
//! the target digest. Each block checks its own header hash and
//! transaction root.
//!
//! Accepted blocks go to the coordinator as `ReadyEvent::Synced`, so the
//! commit stream keeps a single writer.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::block::Block;
use crate::crypto::hash::Hash;
use crate::network::executor::{ReadyEvent, StateUpdateTarget};
use crate::network::transport::{request, PeerTransport, TransportError, WireRequest};
use crate::storage::{SledStore, StorageError};

/// Heights fetched and verified before they are released to the coordinator.
pub const SYNC_WINDOW: u64 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncRequest {
    GetBlock { height: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncResponse {
    Block(Block),
    NotFound { height: u64 },
    Error(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no checkpoint replica served block {height}")]
    NoSource { height: u64 },

    #[error("block {height} does not link to its parent")]
    BrokenLink { height: u64 },

    #[error("block {height} hash does not match the target digest")]
    DigestMismatch { height: u64 },

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("coordinator is gone")]
    Closed,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Somewhere committed blocks can be read back from by height.
pub trait BlockSource: Send + Sync {
    fn block(&self, height: u64) -> Result<Option<Block>, StorageError>;
}

impl BlockSource for SledStore {
    fn block(&self, height: u64) -> Result<Option<Block>, StorageError> {
        self.get_block(height)
    }
}

/// Answer a peer's sync request from `source`.
pub fn handle_sync_request(req: &SyncRequest, source: &dyn BlockSource) -> SyncResponse {
    match req {
        SyncRequest::GetBlock { height } => match source.block(*height) {
            Ok(Some(block)) => SyncResponse::Block(block),
            Ok(None) => SyncResponse::NotFound { height: *height },
            Err(e) => SyncResponse::Error(e.to_string()),
        },
    }
}

// ---------------------------------------------------------------------------
// Fetching
// ---------------------------------------------------------------------------

/// Fetches block ranges from checkpoint replicas.
pub struct BlockFetcher {
    self_id: u64,
    transport: Arc<dyn PeerTransport>,
    fetch_timeout: Duration,
}

impl BlockFetcher {
    pub fn new(self_id: u64, transport: Arc<dyn PeerTransport>, fetch_timeout: Duration) -> Self {
        Self {
            self_id,
            transport,
            fetch_timeout,
        }
    }

    /// Fetch and verify `head.0 + 1 ..= target.height` window by window,
    /// handing each window to `sink` in height order. Returns how many
    /// blocks were delivered.
    pub async fn catch_up(
        &self,
        head: (u64, Hash),
        target: &StateUpdateTarget,
        sink: &mpsc::Sender<ReadyEvent>,
    ) -> Result<usize, SyncError> {
        let (head_height, head_hash) = head;
        if head_height >= target.height {
            return Ok(0);
        }

        let sources: Vec<u64> = target
            .checkpoints
            .iter()
            .copied()
            .filter(|id| *id != self.self_id)
            .collect();

        let mut parent = head_hash;
        let mut start = head_height + 1;
        let mut fetched = 0;
        loop {
            let end = start.saturating_add(SYNC_WINDOW - 1).min(target.height);
            let mut window = Vec::new();
            for height in start..=end {
                let block = self.fetch_block(height, &sources).await?;
                block.verify().map_err(SyncError::InvalidBlock)?;
                if block.header.parent_hash != parent {
                    return Err(SyncError::BrokenLink { height });
                }
                parent = block.hash();
                window.push(block);
            }

            if end == target.height && hex::encode(parent) != target.digest {
                return Err(SyncError::DigestMismatch { height: end });
            }

            fetched += window.len();
            for block in window {
                sink.send(ReadyEvent::Synced(block))
                    .await
                    .map_err(|_| SyncError::Closed)?;
            }
            debug!(from = start, to = end, "Sync window released");

            if end == target.height {
                break;
            }
            start = end + 1;
        }

        info!(from = head_height + 1, to = target.height, fetched, "Blocks synced");
        Ok(fetched)
    }

    /// Ask each source in turn for `height`; first valid answer wins.
    async fn fetch_block(&self, height: u64, sources: &[u64]) -> Result<Block, SyncError> {
        let req = WireRequest::Sync(SyncRequest::GetBlock { height }).encode()?;

        for &peer in sources {
            let reply = match request(self.transport.as_ref(), peer, req.clone(), self.fetch_timeout).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(peer, height, error = %e, "Block fetch failed");
                    continue;
                }
            };
            match bincode::deserialize::<SyncResponse>(&reply) {
                Ok(SyncResponse::Block(block)) if block.height() == height => return Ok(block),
                Ok(SyncResponse::Block(block)) => {
                    warn!(peer, height, got = block.height(), "Peer returned the wrong height");
                }
                Ok(SyncResponse::NotFound { .. }) => {
                    debug!(peer, height, "Peer does not have block");
                }
                Ok(SyncResponse::Error(e)) => {
                    warn!(peer, height, error = %e, "Peer failed to serve block");
                }
                Err(e) => {
                    warn!(peer, height, error = %e, "Undecodable sync response");
                }
            }
        }

        Err(SyncError::NoSource { height })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::ZERO_HASH;
    use crate::network::memory::MemoryTransport;
    use crate::transaction::Transaction;

    fn chain(len: u64) -> Vec<Block> {
        let mut parent = ZERO_HASH;
        (1..=len)
            .map(|h| {
                let block = Block::new(h, parent, h as i64, vec![Transaction::new("alice", h, vec![])]);
                parent = block.hash();
                block
            })
            .collect()
    }

    fn seeded_store(blocks: &[Block]) -> Arc<SledStore> {
        let store = SledStore::open_temporary().unwrap();
        for b in blocks {
            store.put_block(b).unwrap();
        }
        Arc::new(store)
    }

    fn target_for(block: &Block, checkpoints: Vec<u64>) -> StateUpdateTarget {
        StateUpdateTarget {
            height: block.height(),
            digest: block.hash_hex(),
            checkpoints,
        }
    }

    #[test]
    fn serves_stored_blocks() {
        let blocks = chain(2);
        let store = seeded_store(&blocks);
        assert_eq!(
            handle_sync_request(&SyncRequest::GetBlock { height: 2 }, store.as_ref()),
            SyncResponse::Block(blocks[1].clone())
        );
        assert_eq!(
            handle_sync_request(&SyncRequest::GetBlock { height: 9 }, store.as_ref()),
            SyncResponse::NotFound { height: 9 }
        );
    }

    #[tokio::test]
    async fn fetches_range_in_order() {
        let blocks = chain(5);
        let transport = Arc::new(MemoryTransport::new(1).with_block_source(seeded_store(&blocks)));
        let fetcher = BlockFetcher::new(1, transport, Duration::from_secs(1));
        let (tx, mut rx) = mpsc::channel(16);

        let head = (2, blocks[1].hash());
        let n = fetcher.catch_up(head, &target_for(&blocks[4], vec![1, 2]), &tx).await.unwrap();
        assert_eq!(n, 3);
        for expected in 3..=5 {
            assert_eq!(rx.recv().await.unwrap().height(), expected);
        }
    }

    #[tokio::test]
    async fn rejects_wrong_digest_without_delivering() {
        let blocks = chain(3);
        let transport = Arc::new(MemoryTransport::new(1).with_block_source(seeded_store(&blocks)));
        let fetcher = BlockFetcher::new(1, transport, Duration::from_secs(1));
        let (tx, mut rx) = mpsc::channel(16);

        let mut target = target_for(&blocks[2], vec![2]);
        target.digest = hex::encode([9u8; 32]);
        let result = fetcher.catch_up((0, ZERO_HASH), &target, &tx).await;
        assert!(matches!(result, Err(SyncError::DigestMismatch { height: 3 })));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejects_chain_that_does_not_link_to_head() {
        let blocks = chain(3);
        let transport = Arc::new(MemoryTransport::new(1).with_block_source(seeded_store(&blocks)));
        let fetcher = BlockFetcher::new(1, transport, Duration::from_secs(1));
        let (tx, _rx) = mpsc::channel(16);

        let result = fetcher.catch_up((1, [7u8; 32]), &target_for(&blocks[2], vec![2]), &tx).await;
        assert!(matches!(result, Err(SyncError::BrokenLink { height: 2 })));
    }

    #[tokio::test]
    async fn missing_block_is_no_source() {
        let blocks = chain(3);
        let transport = Arc::new(MemoryTransport::new(1).with_block_source(seeded_store(&blocks[..1])));
        let fetcher = BlockFetcher::new(1, transport, Duration::from_secs(1));
        let (tx, _rx) = mpsc::channel(16);

        let result = fetcher.catch_up((1, blocks[0].hash()), &target_for(&blocks[2], vec![2, 3]), &tx).await;
        assert!(matches!(result, Err(SyncError::NoSource { height: 2 })));
    }

    #[tokio::test]
    async fn long_range_is_released_window_by_window() {
        let blocks = chain(SYNC_WINDOW + 6);
        let last = blocks.last().unwrap();
        let transport = Arc::new(MemoryTransport::new(1).with_block_source(seeded_store(&blocks)));
        let fetcher = BlockFetcher::new(1, transport, Duration::from_secs(1));
        let (tx, mut rx) = mpsc::channel(128);

        let n = fetcher.catch_up((0, ZERO_HASH), &target_for(last, vec![2]), &tx).await.unwrap();
        assert_eq!(n as u64, SYNC_WINDOW + 6);
        for expected in 1..=SYNC_WINDOW + 6 {
            assert_eq!(rx.recv().await.unwrap().height(), expected);
        }
    }

    #[tokio::test]
    async fn distant_target_stops_where_peers_run_out() {
        let blocks = chain(SYNC_WINDOW + 1);
        let transport = Arc::new(MemoryTransport::new(1).with_block_source(seeded_store(&blocks)));
        let fetcher = BlockFetcher::new(1, transport, Duration::from_secs(1));
        let (tx, mut rx) = mpsc::channel(128);

        let target = StateUpdateTarget {
            height: u64::MAX,
            digest: hex::encode([9u8; 32]),
            checkpoints: vec![2],
        };
        let result = fetcher.catch_up((0, ZERO_HASH), &target, &tx).await;
        assert!(matches!(result, Err(SyncError::NoSource { height }) if height == SYNC_WINDOW + 2));

        // The first window was complete and linked, so it went out.
        for expected in 1..=SYNC_WINDOW {
            assert_eq!(rx.recv().await.unwrap().height(), expected);
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn nothing_to_fetch_at_target() {
        let blocks = chain(2);
        let transport = Arc::new(MemoryTransport::new(1));
        let fetcher = BlockFetcher::new(1, transport, Duration::from_secs(1));
        let (tx, _rx) = mpsc::channel(1);
        let head = (2, blocks[1].hash());
        assert_eq!(fetcher.catch_up(head, &target_for(&blocks[1], vec![2]), &tx).await.unwrap(), 0);
    }
}
