//! # chatterlink-node
//!
//! Headless Chatterlink node.
//!
//! This binary provides:
//! - **Encrypted messaging** at the configured privacy level
//! - **Room directory** that announces and learns rooms from its peers
//! - **File transfer** of chunked, signed, encrypted files
//! - **Hidden endpoint** through a local Tor daemon at the maximum level
//!
//! Everything is configured through environment variables (see
//! `chatterlink_core::NodeConfig`).

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use chatterlink_core::logging::init_tracing;
use chatterlink_core::{Node, NodeBackends, NodeConfig};
use chatterlink_net::{AnonymizingTransport, TcpTransport, TorService, Transport};
use chatterlink_shared::{PeerId, PrivacyLevel, SystemClock};
use chatterlink_store::{FsBlobStore, SqliteStore};

const DATABASE_FILE: &str = "chatterlink.db";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    init_tracing();

    info!("Starting Chatterlink node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = NodeConfig::from_env();
    info!(
        listen = %config.listen_addr,
        level = %config.privacy_level,
        bootstrap = config.bootstrap_peers.len(),
        "Loaded configuration"
    );
    let password = config
        .password
        .clone()
        .context("CHATTERLINK_PASSWORD must be set")?;

    // -----------------------------------------------------------------------
    // 3. Open storage
    // -----------------------------------------------------------------------
    let store = match &config.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating data directory {}", dir.display()))?;
            SqliteStore::open_at(&dir.join(DATABASE_FILE))?
        }
        None => SqliteStore::open_default()?,
    };

    // Blob store (creates directory if missing)
    let blobs = FsBlobStore::new(config.blob_storage_path.clone(), config.max_blob_size).await?;

    // -----------------------------------------------------------------------
    // 4. Transport, routed through Tor at the maximum level
    // -----------------------------------------------------------------------
    let anonymizer: Option<Arc<dyn AnonymizingTransport>> =
        (config.privacy_level == PrivacyLevel::Maximum)
            .then(|| Arc::new(TorService::new(config.tor.clone())) as Arc<dyn AnonymizingTransport>);

    let mut tcp = TcpTransport::new(config.listen_addr.clone());
    if let Some(addr) = &config.advertised_addr {
        tcp = tcp.with_advertised_id(PeerId::from(addr.as_str()));
    }
    if let Some(anonymizer) = &anonymizer {
        tcp = tcp.with_anonymizer(anonymizer.clone());
    }
    let transport: Arc<dyn Transport> = Arc::new(tcp);

    // -----------------------------------------------------------------------
    // 5. Start the node
    // -----------------------------------------------------------------------
    let node = Node::new(
        config,
        NodeBackends {
            store: Arc::new(store),
            blobs: Arc::new(blobs),
            transport,
            anonymizer,
            clock: Arc::new(SystemClock),
        },
    )?;
    let local = node.start(&password).await?;
    drop(password);

    info!(
        peer_id = %local,
        user_id = ?node.engine().user_id().await,
        "Node running"
    );

    // -----------------------------------------------------------------------
    // 6. Run until Ctrl+C
    // -----------------------------------------------------------------------
    let mut events = node.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => tracing::debug!(?event, "Node event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event log lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
