//! # Ordering Configuration
//!
//! Everything tunable about a replica lives in one TOML file, `order.toml`.
//! Durations are integer milliseconds so the file stays greppable.
//!
//! ```toml
//! id = 1
//! applied = 0
//! digest = ""
//! storage_path = "data/order"
//!
//! [[peers]]
//! id = 1
//! public_key = "3b6a27bc..."
//! hosts = ["10.0.0.1:60011"]
//!
//! [rbft]
//! set_size = 1000
//! batch_size = 500
//! pool_size = 50000
//!
//! [rbft.timeout]
//! set_ms = 100
//! batch_ms = 200
//! ```
//!
//! Every field has a default. [`OrderConfig::validate`] runs once at
//! startup and is the only place values are checked; nothing downstream
//! re-validates.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::hash::{Hash, ZERO_HASH};
use crate::crypto::keys::PublicKey;
use crate::network::engine::{EngineConfig, EngineParams, EngineTimeouts, External};
use crate::network::membership::PeerInfo;
use crate::network::txcache::BatchPolicy;

use std::sync::Arc;

/// Conventional file name, relative to the repo root.
pub const DEFAULT_CONFIG_FILE: &str = "order.toml";

/// Checkpoint period the engine is configured with.
pub const CHECKPOINT_PERIOD: u64 = 10;

/// Log size, in checkpoint periods, the engine keeps before truncating.
pub const LOG_MULTIPLIER: u64 = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

// ---------------------------------------------------------------------------
// File layout
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfig {
    /// This replica's id. Must appear in `peers`.
    pub id: u64,
    /// Last executed height.
    #[serde(default)]
    pub applied: u64,
    /// Hex hash of the block at `applied`. Empty at genesis.
    #[serde(default)]
    pub digest: String,
    /// Joining an existing cluster rather than bootstrapping one.
    #[serde(default)]
    pub is_new: bool,
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub rbft: RbftConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: u64,
    /// Hex Ed25519 public key.
    pub public_key: String,
    #[serde(default)]
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RbftConfig {
    /// Transactions per cache cut.
    pub set_size: usize,
    /// Transactions per engine batch.
    pub batch_size: u64,
    /// Engine transaction pool capacity.
    pub pool_size: u64,
    /// Transactions the cache holds before `Prepare` sees backpressure.
    pub cache_capacity: usize,
    pub batch_mem_limit: bool,
    /// Serialized bytes per batch when `batch_mem_limit` is on.
    pub batch_max_mem: u64,
    /// View change period in heights. Zero disables periodic view change.
    pub vc_period: u64,
    pub check_interval_ms: u64,
    pub tolerance_time_ms: u64,
    /// Smallest membership a removal may leave behind.
    pub min_replicas: usize,
    pub timeout: TimeoutConfig,
}

impl Default for RbftConfig {
    fn default() -> Self {
        Self {
            set_size: 1000,
            batch_size: 500,
            pool_size: 50_000,
            cache_capacity: 10_000,
            batch_mem_limit: false,
            batch_max_mem: 10 * 1024 * 1024,
            vc_period: 0,
            check_interval_ms: 100_000,
            tolerance_time_ms: 300_000,
            min_replicas: 4,
            timeout: TimeoutConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub sync_state_ms: u64,
    pub sync_interval_ms: u64,
    pub recovery_ms: u64,
    pub first_request_ms: u64,
    pub batch_ms: u64,
    pub request_ms: u64,
    pub null_request_ms: u64,
    pub viewchange_ms: u64,
    pub resend_viewchange_ms: u64,
    pub clean_viewchange_ms: u64,
    pub update_ms: u64,
    /// Cache cut timeout.
    pub set_ms: u64,
    /// Per-request bound on state transfer fetches.
    pub fetch_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            sync_state_ms: 3_000,
            sync_interval_ms: 40_000,
            recovery_ms: 10_000,
            first_request_ms: 30_000,
            batch_ms: 200,
            request_ms: 6_000,
            null_request_ms: 9_000,
            viewchange_ms: 1_000,
            resend_viewchange_ms: 8_000,
            clean_viewchange_ms: 60_000,
            update_ms: 4_000,
            set_ms: 100,
            fetch_ms: 3_000,
        }
    }
}

impl TimeoutConfig {
    fn named(&self) -> [(&'static str, u64); 13] {
        [
            ("sync_state_ms", self.sync_state_ms),
            ("sync_interval_ms", self.sync_interval_ms),
            ("recovery_ms", self.recovery_ms),
            ("first_request_ms", self.first_request_ms),
            ("batch_ms", self.batch_ms),
            ("request_ms", self.request_ms),
            ("null_request_ms", self.null_request_ms),
            ("viewchange_ms", self.viewchange_ms),
            ("resend_viewchange_ms", self.resend_viewchange_ms),
            ("clean_viewchange_ms", self.clean_viewchange_ms),
            ("update_ms", self.update_ms),
            ("set_ms", self.set_ms),
            ("fetch_ms", self.fetch_ms),
        ]
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data/order")
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl OrderConfig {
    /// Read, parse, and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// A one-replica cluster, for development.
    pub fn solo(id: u64, public_key: &PublicKey) -> Self {
        Self {
            id,
            applied: 0,
            digest: String::new(),
            is_new: false,
            storage_path: default_storage_path(),
            peers: vec![PeerConfig {
                id,
                public_key: public_key.to_hex(),
                hosts: vec![],
            }],
            rbft: RbftConfig {
                min_replicas: 1,
                ..RbftConfig::default()
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let rbft = &self.rbft;
        for (name, value) in [
            ("set_size", rbft.set_size as u64),
            ("batch_size", rbft.batch_size),
            ("pool_size", rbft.pool_size),
            ("cache_capacity", rbft.cache_capacity as u64),
            ("min_replicas", rbft.min_replicas as u64),
            ("check_interval_ms", rbft.check_interval_ms),
            ("tolerance_time_ms", rbft.tolerance_time_ms),
        ] {
            if value == 0 {
                return Err(invalid(format!("rbft.{name} must be positive")));
            }
        }
        for (name, value) in rbft.timeout.named() {
            if value == 0 {
                return Err(invalid(format!("rbft.timeout.{name} must be positive")));
            }
        }
        if rbft.batch_mem_limit && rbft.batch_max_mem == 0 {
            return Err(invalid("batch_mem_limit is on but batch_max_mem is zero"));
        }

        if self.peers.is_empty() {
            return Err(invalid("peer list is empty"));
        }
        let mut seen = BTreeSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.id) {
                return Err(invalid(format!("duplicate peer id {}", peer.id)));
            }
            PublicKey::from_hex(&peer.public_key)
                .map_err(|_| invalid(format!("peer {} has a malformed public key", peer.id)))?;
        }
        if !seen.contains(&self.id) {
            return Err(invalid(format!("own id {} is not in the peer list", self.id)));
        }
        if self.peers.len() < rbft.min_replicas {
            return Err(invalid(format!(
                "{} peers configured, min_replicas is {}",
                self.peers.len(),
                rbft.min_replicas
            )));
        }

        self.head_hash()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Derived values
    // -----------------------------------------------------------------------

    /// Bootstrap membership, ascending by id.
    pub fn peer_infos(&self) -> Result<Vec<PeerInfo>, ConfigError> {
        let mut infos = self
            .peers
            .iter()
            .map(|p| {
                Ok(PeerInfo {
                    id: p.id,
                    public_key: PublicKey::from_hex(&p.public_key)
                        .map_err(|_| invalid(format!("peer {} has a malformed public key", p.id)))?,
                    hosts: p.hosts.clone(),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        infos.sort_by_key(|p| p.id);
        Ok(infos)
    }

    /// Hash of the block at `applied`, from `digest`.
    pub fn head_hash(&self) -> Result<Hash, ConfigError> {
        if self.digest.is_empty() {
            return Ok(ZERO_HASH);
        }
        let bytes = hex::decode(&self.digest).map_err(|_| invalid("digest is not hex"))?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| invalid("digest must be 32 bytes"))
    }

    pub fn cache_policy(&self) -> BatchPolicy {
        BatchPolicy {
            set_size: self.rbft.set_size,
            set_timeout: ms(self.rbft.timeout.set_ms),
            max_mem: self.rbft.batch_mem_limit.then_some(self.rbft.batch_max_mem),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        ms(self.rbft.timeout.fetch_ms)
    }

    pub fn engine_params(&self) -> Result<EngineParams, ConfigError> {
        let peers = self
            .peer_infos()?
            .iter()
            .map(|info| info.to_peer().map_err(|e| invalid(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        let t = &self.rbft.timeout;

        Ok(EngineParams {
            id: self.id,
            is_new: self.is_new,
            applied: self.applied,
            digest: self.digest.clone(),
            peers,
            k: CHECKPOINT_PERIOD,
            log_multiplier: LOG_MULTIPLIER,
            vc_period: self.rbft.vc_period,
            set_size: self.rbft.set_size,
            batch_size: self.rbft.batch_size,
            pool_size: self.rbft.pool_size,
            batch_mem_limit: self.rbft.batch_mem_limit,
            batch_max_mem: self.rbft.batch_max_mem,
            tolerance_time: ms(self.rbft.tolerance_time_ms),
            timeouts: EngineTimeouts {
                sync_state: ms(t.sync_state_ms),
                sync_state_restart: ms(t.sync_interval_ms),
                recovery: ms(t.recovery_ms),
                first_request: ms(t.first_request_ms),
                batch: ms(t.batch_ms),
                request: ms(t.request_ms),
                null_request: ms(t.null_request_ms),
                new_view: ms(t.viewchange_ms),
                resend_viewchange: ms(t.resend_viewchange_ms),
                clean_viewchange: ms(t.clean_viewchange_ms),
                update: ms(t.update_ms),
                set: ms(t.set_ms),
                check_pool: ms(self.rbft.check_interval_ms),
            },
        })
    }

    pub fn engine_config(&self, external: Arc<dyn External>) -> Result<EngineConfig, ConfigError> {
        Ok(EngineConfig {
            params: self.engine_params()?,
            external,
        })
    }
}
