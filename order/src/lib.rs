// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # RBFT Order — Ordering Layer
//!
//! The adapter a blockchain node puts around an external RBFT replication
//! engine. The engine decides the order of transaction batches; this crate
//! feeds it batches, carries its messages, applies the membership changes
//! it agrees on, and turns every ordered height into a block on a commit
//! stream the rest of the node consumes.
//!
//! ## Architecture
//!
//! - **config** — `order.toml`: membership bootstrap, batch thresholds, timeouts.
//! - **crypto** — BLAKE3 hashing and Ed25519 replica keys.
//! - **transaction** — Transactions and the sets they are proposed in.
//! - **block** — Blocks, commit events, and the executed-state token.
//! - **storage** — sled-backed store for engine state and archived blocks.
//! - **network** — Transaction cache, membership, the Stack, the node
//!   coordinator, and a single-replica engine.
//!
//! ## Ground Rules
//!
//! 1. Heights reach the commit stream exactly once and strictly in order.
//! 2. A message that does not verify never reaches the engine.
//! 3. Busy is an error value. Broken is a panic.

pub mod block;
pub mod config;
pub mod crypto;
pub mod network;
pub mod storage;
pub mod transaction;

pub use block::{Block, CommitEvent, ServiceState};
pub use config::{ConfigError, OrderConfig};
pub use network::{CommitStream, Lifecycle, Node, OrderError, SoloEngine};
pub use transaction::{Transaction, TxSet};
