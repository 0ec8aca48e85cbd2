//! The cluster-wide file index.
//!
//! A single task consumes the peers' inventory updates and maintains
//! three maps under one lock: path → owning node, node → paths, and
//! node → time of last update. Entries older than the freshness window
//! are treated as absent; a stale hit must never route a subscriber to a
//! publisher that may already be gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fleetcast_core::{Error, Result};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::node::{PeerFiles, PeerState};
use crate::registry::NodeRegistry;

/// Entries older than this window are treated as absent.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(2);

/// Resolves prefixed paths anywhere in the cluster.
///
/// This is the seam the SRT proxy and the HTTP glue consume; tests
/// substitute their own implementation.
pub trait ClusterReader: Send + Sync {
    /// Returns the URL under which a prefixed path is currently served.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no fresh owner is known.
    fn get_url(&self, path: &str) -> Result<String>;
}

#[derive(Default)]
struct IndexState {
    file_node: HashMap<String, u64>,
    node_files: HashMap<u64, Vec<String>>,
    node_update: HashMap<u64, Instant>,
}

/// The path → node map built from peer inventories.
pub struct FileIndex {
    registry: Arc<NodeRegistry>,
    state: RwLock<IndexState>,
}

impl FileIndex {
    /// Creates an empty index over the given registry.
    #[must_use]
    pub fn new(registry: Arc<NodeRegistry>) -> Arc<Self> {
        Arc::new(Self { registry, state: RwLock::new(IndexState::default()) })
    }

    /// Consumes inventory updates until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut updates: mpsc::Receiver<PeerFiles>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                update = updates.recv() => {
                    match update {
                        Some(update) => self.apply_update(update),
                        None => return,
                    }
                }
                _ = shutdown_rx.changed() => return,
            }
        }
    }

    /// Applies one inventory update: the node's prior entries are
    /// replaced on `connected`, purged on `disconnected`.
    pub fn apply_update(&self, update: PeerFiles) {
        debug!(
            node_id = update.id,
            state = update.state.as_str(),
            files = update.files.len(),
            "inventory update"
        );

        let mut state = self.state.write();

        if let Some(files) = state.node_files.remove(&update.id) {
            for file in files {
                state.file_node.remove(&file);
            }
        }
        state.node_update.remove(&update.id);

        if update.state == PeerState::Connected {
            for file in &update.files {
                state.file_node.insert(file.clone(), update.id);
            }
            state.node_files.insert(update.id, update.files);
            state.node_update.insert(update.id, update.last_update);
        }
    }

    /// Returns the owning node of a path if the entry is fresh.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<u64> {
        let state = self.state.read();

        let node_id = *state.file_node.get(path)?;
        let updated = state.node_update.get(&node_id)?;

        if updated.elapsed() > FRESHNESS_WINDOW {
            debug!(path, node_id, "index entry too old");
            return None;
        }

        Some(node_id)
    }

    /// Opens a byte stream of a file from its owning peer.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no fresh owner is known or the peer no
    /// longer serves the file.
    pub async fn get_file(&self, path: &str) -> Result<bytes::Bytes> {
        let node_id = self.lookup(path).ok_or_else(|| Error::not_found(format!("file '{path}'")))?;
        let peer = self.registry.peer(node_id)?;
        peer.get_file(path).await
    }
}

impl ClusterReader for FileIndex {
    fn get_url(&self, path: &str) -> Result<String> {
        let node_id = self.lookup(path).ok_or_else(|| Error::not_found(format!("file '{path}'")))?;
        let peer = self.registry.peer(node_id)?;
        peer.url_for(path)
    }
}
