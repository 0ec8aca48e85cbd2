//! Server side of the raft HTTP transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use parking_lot::Mutex;
use tracing::{error, info};

use crate::types::{FleetRaft, RaftNodeId, TypeConfig};

/// Tracks when this node last heard from a raft peer.
///
/// Incoming append-entries and vote RPCs count as contact, which makes the
/// leader's heartbeats visible to the emergency-leader sentinel. A node
/// that never heard from anyone reports the literal `"never"`.
pub struct ContactTracker {
    last: Mutex<Option<Instant>>,
}

impl Default for ContactTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ContactTracker {
    /// Creates a tracker with no recorded contact.
    #[must_use]
    pub fn new() -> Self {
        Self { last: Mutex::new(None) }
    }

    /// Records a contact now.
    pub fn touch(&self) {
        *self.last.lock() = Some(Instant::now());
    }

    /// Returns the time since the last contact, or `None` if there never
    /// was one.
    #[must_use]
    pub fn since_last(&self) -> Option<Duration> {
        self.last.lock().map(|t| t.elapsed())
    }

    /// Returns the stats string for the last contact: a duration in
    /// seconds like `"1.503s"`, or the literal `"never"`.
    #[must_use]
    pub fn as_stat(&self) -> String {
        match self.since_last() {
            Some(d) => format!("{:.3}s", d.as_secs_f64()),
            None => "never".to_string(),
        }
    }
}

struct RaftServerState {
    raft: FleetRaft,
    contact: Arc<ContactTracker>,
}

/// Starts the raft transport server on `addr`.
///
/// The returned sender shuts the server down when dropped or triggered.
///
/// # Errors
///
/// Returns an error if the listener cannot bind. This failure is fatal at
/// boot.
pub async fn serve_raft(
    addr: SocketAddr,
    raft: FleetRaft,
    contact: Arc<ContactTracker>,
) -> std::io::Result<tokio::sync::oneshot::Sender<()>> {
    let state = Arc::new(RaftServerState { raft, contact });

    let app = Router::new()
        .route("/raft/append", post(append))
        .route("/raft/vote", post(vote))
        .route("/raft/snapshot", post(snapshot))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    info!(addr = %addr, "raft transport listening");

    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "raft transport server error");
        }
    });

    Ok(shutdown_tx)
}

async fn append(
    State(state): State<Arc<RaftServerState>>,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> Json<Result<AppendEntriesResponse<RaftNodeId>, openraft::error::RaftError<RaftNodeId>>> {
    state.contact.touch();
    Json(state.raft.append_entries(req).await)
}

async fn vote(
    State(state): State<Arc<RaftServerState>>,
    Json(req): Json<VoteRequest<RaftNodeId>>,
) -> Json<Result<VoteResponse<RaftNodeId>, openraft::error::RaftError<RaftNodeId>>> {
    state.contact.touch();
    Json(state.raft.vote(req).await)
}

async fn snapshot(
    State(state): State<Arc<RaftServerState>>,
    Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Json<
    Result<
        InstallSnapshotResponse<RaftNodeId>,
        openraft::error::RaftError<RaftNodeId, openraft::error::InstallSnapshotError>,
    >,
> {
    state.contact.touch();
    Json(state.raft.install_snapshot(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contact_tracker_never() {
        let tracker = ContactTracker::new();
        assert!(tracker.since_last().is_none());
        assert_eq!(tracker.as_stat(), "never");
    }

    #[test]
    fn test_contact_tracker_touch() {
        let tracker = ContactTracker::new();
        tracker.touch();
        let since = tracker.since_last().unwrap();
        assert!(since < Duration::from_secs(1));
        assert!(tracker.as_stat().ends_with('s'));
    }
}
