//! # Membership Table
//!
//! The set of replicas taking part in ordering, keyed by numeric id. It is
//! mutated in exactly one place, [`Membership::apply`], which the Stack calls
//! once per conf change the engine has agreed on, in delivery order. Every
//! other access is a read through a consistent snapshot.
//!
//! ## Peer descriptors
//!
//! The engine treats a peer's routing context as opaque bytes. This crate
//! puts a bincode [`PeerInfo`] there, so an `Add` change is decoded twice:
//! `ConfChange.context` → [`Peer`] → `Peer.context` → [`PeerInfo`]. A
//! failure at either level leaves the table untouched.
//!
//! ## Quorum
//!
//! For `N` members, `f = (N - 1) / 3` faults are tolerated and a commit
//! needs `(N + f + 2) / 2` agreeing replicas (integer division). The value
//! is recomputed under the write lock on every change, so readers never see
//! a quorum that disagrees with the table next to it.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::crypto::keys::PublicKey;
use crate::network::engine::{ConfChange, ConfChangeKind, Peer, Router};

/// What a replica's routing context decodes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: u64,
    pub public_key: PublicKey,
    /// Transport addresses, in preference order.
    pub hosts: Vec<String>,
}

impl PeerInfo {
    /// Wrap this descriptor as an engine-facing [`Peer`].
    pub fn to_peer(&self) -> Result<Peer, bincode::Error> {
        Ok(Peer {
            id: self.id,
            context: bincode::serialize(self)?,
        })
    }

    pub fn from_peer(peer: &Peer) -> Result<Self, MembershipError> {
        let info: PeerInfo =
            bincode::deserialize(&peer.context).map_err(|_| MembershipError::UndecodableContext)?;
        if info.id != peer.id {
            return Err(MembershipError::MismatchedId {
                expected: peer.id,
                found: info.id,
            });
        }
        Ok(info)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MembershipError {
    #[error("conf change context could not be decoded")]
    UndecodableContext,

    #[error("peer descriptor id {found} does not match {expected}")]
    MismatchedId { expected: u64, found: u64 },

    #[error("peer {0} is already a member")]
    DuplicatePeer(u64),

    #[error("peer {0} is not a member")]
    UnknownPeer(u64),

    #[error("membership would shrink to {remaining}, below the minimum of {minimum}")]
    BelowMinimum { remaining: usize, minimum: usize },
}

/// The effect an applied conf change had on the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Added(PeerInfo),
    Removed(u64),
    Replaced(Vec<PeerInfo>),
    /// Removal of an id that was not a member.
    Unchanged,
}

/// Smallest agreeing set that can commit with `n` members.
pub fn quorum_for(n: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    let f = (n - 1) / 3;
    (n + f + 2) / 2
}

struct Table {
    peers: BTreeMap<u64, PeerInfo>,
    quorum: u64,
}

impl Table {
    fn new(peers: BTreeMap<u64, PeerInfo>) -> Self {
        let quorum = quorum_for(peers.len() as u64);
        Self { peers, quorum }
    }

    fn refresh_quorum(&mut self) {
        self.quorum = quorum_for(self.peers.len() as u64);
    }
}

pub struct Membership {
    self_id: u64,
    min_replicas: usize,
    table: RwLock<Table>,
}

impl Membership {
    /// Build the table from the bootstrap peer list.
    pub fn new(self_id: u64, min_replicas: usize, peers: Vec<PeerInfo>) -> Self {
        let peers = peers.into_iter().map(|p| (p.id, p)).collect();
        Self {
            self_id,
            min_replicas,
            table: RwLock::new(Table::new(peers)),
        }
    }

    pub fn self_id(&self) -> u64 {
        self.self_id
    }

    pub fn min_replicas(&self) -> usize {
        self.min_replicas
    }

    /// Apply one engine-agreed conf change.
    ///
    /// On any error the table is exactly as it was before the call.
    pub fn apply(&self, change: &ConfChange) -> Result<ApplyOutcome, MembershipError> {
        match change.kind {
            ConfChangeKind::Add => {
                let peer: Peer = bincode::deserialize(&change.context)
                    .map_err(|_| MembershipError::UndecodableContext)?;
                if peer.id != change.node_id {
                    return Err(MembershipError::MismatchedId {
                        expected: change.node_id,
                        found: peer.id,
                    });
                }
                let info = PeerInfo::from_peer(&peer)?;

                let mut table = self.table.write();
                if table.peers.contains_key(&info.id) {
                    return Err(MembershipError::DuplicatePeer(info.id));
                }
                table.peers.insert(info.id, info.clone());
                table.refresh_quorum();
                info!(peer = info.id, size = table.peers.len(), "Peer added");
                Ok(ApplyOutcome::Added(info))
            }
            ConfChangeKind::Remove => {
                let mut table = self.table.write();
                if !table.peers.contains_key(&change.node_id) {
                    debug!(peer = change.node_id, "Remove of unknown peer ignored");
                    return Ok(ApplyOutcome::Unchanged);
                }
                let remaining = table.peers.len() - 1;
                if remaining < self.min_replicas {
                    return Err(MembershipError::BelowMinimum {
                        remaining,
                        minimum: self.min_replicas,
                    });
                }
                table.peers.remove(&change.node_id);
                table.refresh_quorum();
                info!(peer = change.node_id, size = table.peers.len(), "Peer removed");
                Ok(ApplyOutcome::Removed(change.node_id))
            }
            ConfChangeKind::Update => {
                let router: Router = bincode::deserialize(&change.context)
                    .map_err(|_| MembershipError::UndecodableContext)?;

                // Decode everything before touching the table.
                let mut next = BTreeMap::new();
                for peer in &router.peers {
                    let info = PeerInfo::from_peer(peer)?;
                    if next.insert(info.id, info).is_some() {
                        return Err(MembershipError::DuplicatePeer(peer.id));
                    }
                }
                if next.len() < self.min_replicas {
                    return Err(MembershipError::BelowMinimum {
                        remaining: next.len(),
                        minimum: self.min_replicas,
                    });
                }

                let replaced: Vec<PeerInfo> = next.values().cloned().collect();
                let mut table = self.table.write();
                *table = Table::new(next);
                info!(size = table.peers.len(), "Membership replaced");
                Ok(ApplyOutcome::Replaced(replaced))
            }
        }
    }

    /// Whether removing `id` would be accepted. Used before proposing a
    /// removal so the engine is not asked for something apply would refuse.
    pub fn check_removal(&self, id: u64) -> Result<(), MembershipError> {
        let table = self.table.read();
        if !table.peers.contains_key(&id) {
            return Err(MembershipError::UnknownPeer(id));
        }
        let remaining = table.peers.len() - 1;
        if remaining < self.min_replicas {
            return Err(MembershipError::BelowMinimum {
                remaining,
                minimum: self.min_replicas,
            });
        }
        Ok(())
    }

    pub fn quorum(&self) -> u64 {
        self.table.read().quorum
    }

    pub fn len(&self) -> usize {
        self.table.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().peers.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.table.read().peers.contains_key(&id)
    }

    pub fn public_key(&self, id: u64) -> Option<PublicKey> {
        self.table.read().peers.get(&id).map(|p| p.public_key)
    }

    /// Consistent copy of the table, ascending by id.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.table.read().peers.values().cloned().collect()
    }

    /// Member ids other than this replica, ascending.
    pub fn others(&self) -> Vec<u64> {
        self.table
            .read()
            .peers
            .keys()
            .copied()
            .filter(|id| *id != self.self_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::ReplicaKeypair;

    fn info(id: u64) -> PeerInfo {
        PeerInfo {
            id,
            public_key: ReplicaKeypair::from_seed(&[id as u8; 32]).public_key(),
            hosts: vec![format!("127.0.0.1:{}", 7000 + id)],
        }
    }

    fn table(n: u64, min: usize) -> Membership {
        Membership::new(1, min, (1..=n).map(info).collect())
    }

    fn add_change(id: u64) -> ConfChange {
        ConfChange::add(&info(id).to_peer().unwrap()).unwrap()
    }

    #[test]
    fn test_add_then_remove_restores_table() {
        let m = table(4, 4);
        let before = m.snapshot();

        assert_eq!(m.apply(&add_change(5)).unwrap(), ApplyOutcome::Added(info(5)));
        assert_eq!(m.len(), 5);

        assert_eq!(m.apply(&ConfChange::remove(5)).unwrap(), ApplyOutcome::Removed(5));
        assert_eq!(m.snapshot(), before);
    }

    #[test]
    fn test_undecodable_add_is_noop() {
        let m = table(3, 1);
        let before = m.snapshot();

        let mut change = add_change(4);
        change.context = b"test".to_vec();
        assert_eq!(m.apply(&change), Err(MembershipError::UndecodableContext));
        assert_eq!(m.snapshot(), before);

        // Outer peer decodes, inner descriptor does not.
        let peer = Peer { id: 4, context: b"test".to_vec() };
        let change = ConfChange::add(&peer).unwrap();
        assert_eq!(m.apply(&change), Err(MembershipError::UndecodableContext));
        assert_eq!(m.snapshot(), before);
    }

    #[test]
    fn test_duplicate_add_is_error_and_noop() {
        let m = table(4, 1);
        assert_eq!(m.apply(&add_change(2)), Err(MembershipError::DuplicatePeer(2)));
        assert_eq!(m.len(), 4);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let m = table(4, 1);
        assert_eq!(m.apply(&ConfChange::remove(9)).unwrap(), ApplyOutcome::Unchanged);
        assert_eq!(m.len(), 4);
    }

    #[test]
    fn test_remove_respects_minimum() {
        let m = table(4, 4);
        assert_eq!(
            m.apply(&ConfChange::remove(2)),
            Err(MembershipError::BelowMinimum { remaining: 3, minimum: 4 })
        );
        assert_eq!(m.len(), 4);
        assert!(m.check_removal(2).is_err());
        assert_eq!(m.check_removal(9), Err(MembershipError::UnknownPeer(9)));

        let m = table(3, 1);
        assert_eq!(m.apply(&ConfChange::remove(2)).unwrap(), ApplyOutcome::Removed(2));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn test_update_replaces_whole_table() {
        let m = table(3, 1);

        let mut change = ConfChange::update(&Router::default()).unwrap();
        change.context = b"test".to_vec();
        assert!(m.apply(&change).is_err());
        assert_eq!(m.len(), 3);

        let router = Router {
            peers: vec![info(1).to_peer().unwrap(), info(2).to_peer().unwrap()],
        };
        let outcome = m.apply(&ConfChange::update(&router).unwrap()).unwrap();
        assert_eq!(outcome, ApplyOutcome::Replaced(vec![info(1), info(2)]));
        assert_eq!(m.len(), 2);
        assert_eq!(m.quorum(), quorum_for(2));
    }

    #[test]
    fn test_update_with_one_bad_peer_changes_nothing() {
        let m = table(3, 1);
        let router = Router {
            peers: vec![
                info(1).to_peer().unwrap(),
                Peer { id: 2, context: vec![0xFF] },
            ],
        };
        assert!(m.apply(&ConfChange::update(&router).unwrap()).is_err());
        assert_eq!(m.snapshot(), vec![info(1), info(2), info(3)]);
    }

    #[test]
    fn test_quorum_values() {
        assert_eq!(quorum_for(1), 1);
        assert_eq!(quorum_for(3), 2);
        assert_eq!(quorum_for(4), 3);
        assert_eq!(quorum_for(7), 5);
        assert_eq!(quorum_for(10), 7);
        assert_eq!(quorum_for(0), 0);
    }

    #[test]
    fn test_quorum_tracks_membership() {
        let m = table(4, 1);
        assert_eq!(m.quorum(), 3);
        m.apply(&add_change(5)).unwrap();
        m.apply(&add_change(6)).unwrap();
        m.apply(&add_change(7)).unwrap();
        assert_eq!(m.quorum(), 5);
    }

    #[test]
    fn test_others_excludes_self() {
        let m = table(4, 1);
        assert_eq!(m.others(), vec![2, 3, 4]);
        assert!(m.public_key(3).is_some());
        assert!(m.public_key(9).is_none());
    }
}
