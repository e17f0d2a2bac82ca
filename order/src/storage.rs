//! # Order Storage
//!
//! The engine keeps its own log, checkpoints, and view state. It persists
//! them through the Stack's storage callbacks, which land here. The same
//! database also keeps committed blocks by height so a lagging replica can
//! fetch them during state transfer.
//!
//! ## Tree Layout
//!
//! | Tree        | Key                | Value            |
//! |-------------|--------------------|------------------|
//! | `consensus` | engine key (UTF-8) | opaque bytes     |
//! | `blocks`    | `height` (8B BE)   | `bincode(Block)` |
//!
//! Heights are big-endian so sled's lexicographic order is numeric order.

use std::collections::BTreeMap;
use std::path::Path;

use sled::{Db, Tree};

use crate::block::Block;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("stored key is not valid UTF-8")]
    InvalidKey,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Key/value persistence for engine state.
pub trait StateStore: Send + Sync {
    fn store_state(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    fn del_state(&self, key: &str) -> StorageResult<()>;

    fn read_state(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Every entry whose key starts with `prefix`, ordered by key.
    fn read_state_set(&self, prefix: &str) -> StorageResult<BTreeMap<String, Vec<u8>>>;

    /// Remove every entry whose key starts with `prefix`.
    fn destroy(&self, prefix: &str) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// SledStore
// ---------------------------------------------------------------------------

/// sled-backed [`StateStore`], plus a height-indexed block archive.
///
/// Cheap to clone; clones share the underlying database.
#[derive(Debug, Clone)]
pub struct SledStore {
    db: Db,
    consensus: Tree,
    blocks: Tree,
}

impl SledStore {
    /// Open or create a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory store removed on drop. For tests and solo mode.
    pub fn open_temporary() -> StorageResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StorageResult<Self> {
        let consensus = db.open_tree("consensus")?;
        let blocks = db.open_tree("blocks")?;
        Ok(Self {
            db,
            consensus,
            blocks,
        })
    }

    /// Archive a committed block under its height. Overwrites.
    pub fn put_block(&self, block: &Block) -> StorageResult<()> {
        let value =
            bincode::serialize(block).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.blocks.insert(block.height().to_be_bytes(), value)?;
        Ok(())
    }

    pub fn get_block(&self, height: u64) -> StorageResult<Option<Block>> {
        match self.blocks.get(height.to_be_bytes())? {
            Some(bytes) => {
                let block = bincode::deserialize(&bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    /// Highest archived height, if any block has been archived.
    pub fn latest_height(&self) -> StorageResult<Option<u64>> {
        match self.blocks.last()? {
            Some((key, _)) => {
                let bytes: [u8; 8] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| StorageError::Serialization("malformed height key".into()))?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl StateStore for SledStore {
    fn store_state(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.consensus.insert(key.as_bytes(), value)?;
        Ok(())
    }

    fn del_state(&self, key: &str) -> StorageResult<()> {
        self.consensus.remove(key.as_bytes())?;
        Ok(())
    }

    fn read_state(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.consensus.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn read_state_set(&self, prefix: &str) -> StorageResult<BTreeMap<String, Vec<u8>>> {
        let mut out = BTreeMap::new();
        for entry in self.consensus.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry?;
            let key = String::from_utf8(key.to_vec()).map_err(|_| StorageError::InvalidKey)?;
            out.insert(key, value.to_vec());
        }
        Ok(out)
    }

    fn destroy(&self, prefix: &str) -> StorageResult<()> {
        let mut batch = sled::Batch::default();
        for entry in self.consensus.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry?;
            batch.remove(key);
        }
        self.consensus.apply_batch(batch)?;
        Ok(())
    }
}
