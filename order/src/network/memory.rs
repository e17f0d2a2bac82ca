//! In-process [`PeerTransport`] for single-replica mode and tests.
//!
//! Outbound broadcasts and unicasts are recorded rather than delivered.
//! Requests are answered locally: sync requests from an attached
//! [`BlockSource`], anything else as unreachable.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::network::membership::PeerInfo;
use crate::network::sync::{handle_sync_request, BlockSource};
use crate::network::transport::{PeerTransport, TransportError, WireRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Broadcast(Vec<u8>),
    Unicast { to: u64, bytes: Vec<u8> },
}

pub struct MemoryTransport {
    self_id: u64,
    peers: RwLock<BTreeMap<u64, PeerInfo>>,
    outbox: Mutex<Vec<Outbound>>,
    block_source: Option<Arc<dyn BlockSource>>,
}

impl MemoryTransport {
    pub fn new(self_id: u64) -> Self {
        Self {
            self_id,
            peers: RwLock::new(BTreeMap::new()),
            outbox: Mutex::new(Vec::new()),
            block_source: None,
        }
    }

    /// Answer sync requests from `source`.
    pub fn with_block_source(mut self, source: Arc<dyn BlockSource>) -> Self {
        self.block_source = Some(source);
        self
    }

    /// Everything sent so far, oldest first.
    pub fn outbound(&self) -> Vec<Outbound> {
        self.outbox.lock().clone()
    }

    pub fn take_outbound(&self) -> Vec<Outbound> {
        std::mem::take(&mut *self.outbox.lock())
    }

    pub fn peer_info(&self, id: u64) -> Option<PeerInfo> {
        self.peers.read().get(&id).cloned()
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn broadcast(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        trace!(len = bytes.len(), "broadcast");
        self.outbox.lock().push(Outbound::Broadcast(bytes));
        Ok(())
    }

    async fn unicast(&self, to: u64, bytes: Vec<u8>) -> Result<(), TransportError> {
        trace!(to, len = bytes.len(), "unicast");
        self.outbox.lock().push(Outbound::Unicast { to, bytes });
        Ok(())
    }

    async fn send(&self, to: u64, bytes: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        match (WireRequest::decode(&bytes)?, &self.block_source) {
            (WireRequest::Sync(req), Some(source)) => {
                let response = handle_sync_request(&req, source.as_ref());
                bincode::serialize(&response).map_err(|e| TransportError::Encode(e.to_string()))
            }
            _ => Err(TransportError::PeerUnreachable(to)),
        }
    }

    fn peers(&self) -> Vec<u64> {
        self.peers
            .read()
            .keys()
            .copied()
            .filter(|id| *id != self.self_id)
            .collect()
    }

    fn add_peer(&self, peer: &PeerInfo) {
        self.peers.write().insert(peer.id, peer.clone());
    }

    fn remove_peer(&self, id: u64) {
        self.peers.write().remove(&id);
    }

    fn update_router(&self, peers: &[PeerInfo]) {
        let mut table = self.peers.write();
        table.clear();
        table.extend(peers.iter().map(|p| (p.id, p.clone())));
    }
}
