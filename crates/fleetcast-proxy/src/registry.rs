//! The node registry.
//!
//! Reconciles the replicated node table into live [`Peer`] runtimes: one
//! peer per descriptor, excluding this node. Reconciliation runs when the
//! store applies a node operation and once per second as a fallback for
//! peers whose connect attempt failed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleetcast_consensus::Store;
use fleetcast_core::{Error, Result};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{info, warn};

use crate::node::{Peer, PeerAbout, PeerFiles, PeerState};

/// Capacity of the inventory updates channel.
const UPDATES_CAPACITY: usize = 64;

/// Maintains one peer runtime per remote node.
pub struct NodeRegistry {
    self_id: u64,
    store: Arc<Store>,
    peers: RwLock<HashMap<u64, Arc<Peer>>>,
    updates_tx: mpsc::Sender<PeerFiles>,
    notify: Arc<Notify>,
}

impl NodeRegistry {
    /// Creates the registry. The returned receiver carries the peers'
    /// file inventory updates and feeds the cluster file index.
    #[must_use]
    pub fn new(self_id: u64, store: Arc<Store>) -> (Arc<Self>, mpsc::Receiver<PeerFiles>) {
        let (updates_tx, updates_rx) = mpsc::channel(UPDATES_CAPACITY);

        let registry = Arc::new(Self {
            self_id,
            store,
            peers: RwLock::new(HashMap::new()),
            updates_tx,
            notify: Arc::new(Notify::new()),
        });

        (registry, updates_rx)
    }

    /// Returns the handle used to trigger reconciliation from the store's
    /// apply hook.
    #[must_use]
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Returns one peer.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such peer is connected.
    pub fn peer(&self, id: u64) -> Result<Arc<Peer>> {
        self.peers
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("node {id}")))
    }

    /// Returns snapshots of all connected peers.
    #[must_use]
    pub fn peer_list(&self) -> Vec<PeerAbout> {
        self.peers.read().values().map(|p| p.about()).collect()
    }

    /// Runs the reconcile loop until shutdown, then tears all peers down.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.notify.notified() => {}
                _ = shutdown_rx.changed() => break,
            }

            self.reconcile().await;
        }

        let peers: Vec<Arc<Peer>> = {
            let mut map = self.peers.write();
            map.drain().map(|(_, peer)| peer).collect()
        };
        for peer in peers {
            peer.stop();
        }
    }

    /// Brings the peer map in line with the replicated node table.
    async fn reconcile(&self) {
        let descriptors: HashMap<u64, _> = self
            .store
            .node_list()
            .into_iter()
            .filter(|n| n.id != self.self_id)
            .map(|n| (n.id, n))
            .collect();

        // Tear down peers whose descriptor disappeared.
        let removed: Vec<Arc<Peer>> = {
            let mut peers = self.peers.write();
            let gone: Vec<u64> =
                peers.keys().filter(|id| !descriptors.contains_key(id)).copied().collect();
            gone.into_iter().filter_map(|id| peers.remove(&id)).collect()
        };

        for peer in removed {
            info!(node_id = peer.id(), "removing peer");
            peer.stop();
            // Purge the peer's entries from the file index.
            let _ = self.updates_tx.try_send(PeerFiles {
                id: peer.id(),
                state: PeerState::Disconnected,
                files: Vec::new(),
                last_update: std::time::Instant::now(),
            });
        }

        // Connect peers that appeared.
        for (id, descriptor) in descriptors {
            if self.peers.read().contains_key(&id) {
                continue;
            }

            match Peer::connect(
                id,
                descriptor.api_address.clone(),
                descriptor.username.clone(),
                descriptor.password.clone(),
                self.updates_tx.clone(),
            )
            .await
            {
                Ok(peer) => {
                    self.peers.write().insert(id, peer);
                    metrics::gauge!("fleetcast_peers").set(self.peers.read().len() as f64);
                }
                Err(e) => {
                    // Retried on the next tick.
                    warn!(node_id = id, error = %e, "connecting peer failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_peer_is_not_found() {
        let store = Arc::new(Store::new());
        let (registry, _updates) = NodeRegistry::new(1, store);

        assert!(registry.peer(9).is_err());
        assert!(registry.peer_list().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_skips_self_and_unreachable() {
        let store = Arc::new(Store::new());

        // A descriptor for this node and one for an unreachable peer.
        let now = chrono::Utc::now();
        store
            .apply(
                &fleetcast_consensus::Command::AddNode {
                    id: 1,
                    raft_address: "127.0.0.1:7000".to_string(),
                    api_address: "127.0.0.1:7001".to_string(),
                    username: "u".to_string(),
                    password: "p".to_string(),
                },
                now,
            )
            .unwrap();
        store
            .apply(
                &fleetcast_consensus::Command::AddNode {
                    id: 2,
                    raft_address: "127.0.0.1:1".to_string(),
                    api_address: "127.0.0.1:2".to_string(),
                    username: "u".to_string(),
                    password: "p".to_string(),
                },
                now,
            )
            .unwrap();

        let (registry, _updates) = NodeRegistry::new(1, store);
        registry.reconcile().await;

        // Node 1 is this node; node 2 refuses connections. Neither ends
        // up in the peer map.
        assert!(registry.peer(1).is_err());
        assert!(registry.peer(2).is_err());
    }
}
