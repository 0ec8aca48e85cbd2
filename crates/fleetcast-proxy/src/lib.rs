//! Peer proxy layer: node registry, per-peer runtime and the
//! cluster-wide file index.
//!
//! Every node runs a registry reconciling the replicated node table into
//! live peer connections. Each peer runtime pings its node, samples its
//! resources and collects its file inventory on independent one-second
//! tickers; the inventories feed the [`index::FileIndex`], the
//! cluster-wide map from logical path to owning node.

#![warn(missing_docs)]

pub mod index;
pub mod node;
pub mod registry;

pub use index::{ClusterReader, FileIndex, FRESHNESS_WINDOW};
pub use node::{Peer, PeerAbout, PeerFiles, PeerResources, PeerState};
pub use registry::NodeRegistry;
