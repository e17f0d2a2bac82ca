// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Order Node
//!
//! Entry point for the `order-node` binary. Parses CLI arguments, sets up
//! logging and metrics, runs the ordering layer with the solo engine,
//! archives every committed block, and serves the HTTP API.
//!
//! - `run`     — start the node
//! - `init`    — write a replica key and a single-replica `order.toml`
//! - `version` — print version information

mod api;
mod cli;
mod logging;
mod metrics;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::StreamExt;
use tokio::signal;

use rbft_order::config::{OrderConfig, DEFAULT_CONFIG_FILE};
use rbft_order::crypto::keys::ReplicaKeypair;
use rbft_order::network::{CommitStream, MemoryTransport, Node, SoloEngine};
use rbft_order::storage::SledStore;
use rbft_order::transaction::Transaction;

use cli::{Commands, OrderNodeCli};
use logging::LogFormat;
use metrics::{OrderMetrics, SharedMetrics};

const KEY_FILE: &str = "replica.key";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = OrderNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => {
            logging::init_logging("order_node=info", LogFormat::Pretty);
            init_node(args)
        }
        Commands::Version => {
            println!("order-node {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(&args.log_level, LogFormat::from(args.log_format));

    let mut config = OrderConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let keypair = read_key(&args.key)?;
    check_key_matches(&config, &keypair)?;

    if config.peers.len() > 1 {
        tracing::warn!(
            peers = config.peers.len(),
            "solo engine orders locally; other configured peers are not contacted"
        );
    }

    // --- Storage ---
    std::fs::create_dir_all(&config.storage_path).with_context(|| {
        format!("failed to create storage directory {}", config.storage_path.display())
    })?;
    let store = Arc::new(
        SledStore::open(&config.storage_path)
            .with_context(|| format!("failed to open store at {}", config.storage_path.display()))?,
    );
    resume_from_archive(&mut config, &store)?;

    // --- Metrics ---
    let metrics: SharedMetrics = Arc::new(OrderMetrics::new().context("failed to create metrics")?);
    metrics.committed_height.set(config.applied as i64);

    // --- Ordering layer ---
    let transport = Arc::new(MemoryTransport::new(config.id).with_block_source(store.clone()));
    let node = Arc::new(
        Node::new(&config, keypair, transport, store.clone(), SoloEngine::build)
            .context("failed to create order node")?,
    );
    let commits = node.commit().context("commit stream already taken")?;
    node.start().context("failed to start order node")?;
    metrics.set_ready(node.ready().is_ok());

    let archiver = tokio::spawn(archive_commits(
        commits,
        node.clone(),
        store.clone(),
        metrics.clone(),
    ));

    // --- API server ---
    let router = api::create_router(api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        node: node.clone(),
        metrics: metrics.clone(),
    });
    let addr = format!("0.0.0.0:{}", args.api_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind API listener on {addr}"))?;
    tracing::info!(%addr, id = config.id, applied = config.applied, "order-node listening");

    // --- Serve ---
    let outcome = tokio::select! {
        res = axum::serve(listener, router) => res.context("API server failed"),
        res = archiver => match res {
            Ok(inner) => inner,
            Err(e) => Err(anyhow::anyhow!("archiver task failed: {e}")),
        },
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
            Ok(())
        }
    };

    node.stop();
    node.join().await;
    store.flush().context("failed to flush store")?;
    tracing::info!(height = node.committed_height(), "order-node stopped");
    outcome
}

/// Persist every committed block and acknowledge it to the ordering layer.
/// Returns when the stream ends or the archive fails.
async fn archive_commits(
    mut commits: CommitStream,
    node: Arc<Node>,
    store: Arc<SledStore>,
    metrics: SharedMetrics,
) -> Result<()> {
    while let Some(event) = commits.next().await {
        let height = event.block.height();
        store
            .put_block(&event.block)
            .with_context(|| format!("failed to archive block {height}"))?;

        let hashes: Vec<_> = event.block.transactions.iter().map(Transaction::hash).collect();
        node.report_state(height, &event.block.hash(), &hashes);
        metrics.record_commit(&event);
        tracing::info!(
            height,
            txs = hashes.len(),
            local = event.local_transactions().count(),
            hash = %event.block.hash_hex(),
            "block committed"
        );
    }
    Ok(())
}

/// Start from the archive's head when it is ahead of the configuration.
fn resume_from_archive(config: &mut OrderConfig, store: &SledStore) -> Result<()> {
    let Some(height) = store.latest_height()? else {
        return Ok(());
    };
    if height <= config.applied {
        return Ok(());
    }
    let block = store
        .get_block(height)?
        .with_context(|| format!("archive index names block {height} but it is missing"))?;
    tracing::info!(from = config.applied, to = height, "resuming from archived head");
    config.applied = height;
    config.digest = block.hash_hex();
    Ok(())
}

fn read_key(path: &Path) -> Result<ReplicaKeypair> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read replica key {}", path.display()))?;
    ReplicaKeypair::from_hex(text.trim())
        .with_context(|| format!("malformed replica key in {}", path.display()))
}

fn check_key_matches(config: &OrderConfig, keypair: &ReplicaKeypair) -> Result<()> {
    let own = keypair.public_key().to_hex();
    match config.peers.iter().find(|p| p.id == config.id) {
        Some(peer) if peer.public_key == own => Ok(()),
        Some(_) => bail!("replica key does not match the public key configured for id {}", config.id),
        None => bail!("id {} is not in the peer list", config.id),
    }
}

/// Write a fresh key and a single-replica config into `args.dir`.
fn init_node(args: cli::InitArgs) -> Result<()> {
    let dir = &args.dir;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let key_path = dir.join(KEY_FILE);
    let config_path = dir.join(DEFAULT_CONFIG_FILE);
    for path in [&key_path, &config_path] {
        if path.exists() && !args.force {
            bail!("{} already exists; pass --force to overwrite", path.display());
        }
    }

    let keypair = ReplicaKeypair::generate();
    std::fs::write(&key_path, keypair.secret_key_hex())
        .with_context(|| format!("failed to write {}", key_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    let mut config = OrderConfig::solo(args.id, &keypair.public_key());
    config.storage_path = dir.join("data");
    std::fs::write(&config_path, config.to_toml_string()?)
        .with_context(|| format!("failed to write {}", config_path.display()))?;

    println!("Node initialized.");
    println!("  Config     : {}", config_path.display());
    println!("  Replica key: {}", key_path.display());
    println!("  Public key : {}", keypair.public_key().to_hex());
    Ok(())
}

/// Waits for SIGINT or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbft_order::block::Block;
    use rbft_order::crypto::hash::ZERO_HASH;

    #[test]
    fn init_writes_loadable_config_and_key() {
        let dir = tempfile::tempdir().unwrap();
        init_node(cli::InitArgs {
            dir: dir.path().to_path_buf(),
            id: 3,
            force: false,
        })
        .unwrap();

        let config = OrderConfig::load(dir.path().join(DEFAULT_CONFIG_FILE)).unwrap();
        let keypair = read_key(&dir.path().join(KEY_FILE)).unwrap();
        assert_eq!(config.id, 3);
        check_key_matches(&config, &keypair).unwrap();

        let again = init_node(cli::InitArgs {
            dir: dir.path().to_path_buf(),
            id: 3,
            force: false,
        });
        assert!(again.is_err());
    }

    #[test]
    fn mismatched_key_is_rejected() {
        let keypair = ReplicaKeypair::from_seed(&[1; 32]);
        let config = OrderConfig::solo(1, &ReplicaKeypair::from_seed(&[2; 32]).public_key());
        assert!(check_key_matches(&config, &keypair).is_err());
    }

    #[test]
    fn archive_head_overrides_config() {
        let store = SledStore::open_temporary().unwrap();
        let keypair = ReplicaKeypair::from_seed(&[1; 32]);
        let mut config = OrderConfig::solo(1, &keypair.public_key());

        resume_from_archive(&mut config, &store).unwrap();
        assert_eq!(config.applied, 0);

        let first = Block::new(1, ZERO_HASH, 0, vec![]);
        let second = Block::new(2, first.hash(), 0, vec![]);
        store.put_block(&first).unwrap();
        store.put_block(&second).unwrap();

        resume_from_archive(&mut config, &store).unwrap();
        assert_eq!(config.applied, 2);
        assert_eq!(config.digest, second.hash_hex());
    }
}
