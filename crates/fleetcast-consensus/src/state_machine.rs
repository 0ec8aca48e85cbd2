//! Raft state machine adapter for the configuration store.
//!
//! Bridges openraft's `RaftStateMachine` trait onto [`Store`]: entries are
//! decoded, stamped with one application timestamp each, and applied; the
//! store's canonical JSON dump is the snapshot payload.

use std::io::Cursor;
use std::sync::Arc;

use chrono::Utc;
use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine, Snapshot};
use openraft::{EntryPayload, LogId, OptionalSend, SnapshotMeta, StorageError, StoredMembership};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::response::CommandResponse;
use crate::store::Store;
use crate::types::{RaftMembership, RaftNodeId, RaftSnapshotMeta, TypeConfig};

/// Snapshot payload: the raft bookkeeping plus the store's full state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotData {
    /// Last applied log id.
    pub last_applied: Option<LogId<RaftNodeId>>,
    /// Last membership configuration.
    pub last_membership: RaftMembership,
    /// Canonical JSON dump of the store.
    pub state: Vec<u8>,
}

fn write_error<E: std::error::Error + 'static>(e: E) -> StorageError<RaftNodeId> {
    StorageError::from_io_error(
        openraft::ErrorSubject::Store,
        openraft::ErrorVerb::Write,
        std::io::Error::other(e.to_string()),
    )
}

fn read_error<E: std::error::Error + 'static>(e: E) -> StorageError<RaftNodeId> {
    StorageError::from_io_error(
        openraft::ErrorSubject::Store,
        openraft::ErrorVerb::Read,
        std::io::Error::other(e.to_string()),
    )
}

/// Raft state machine backed by the replicated configuration store.
pub struct StoreStateMachine {
    store: Arc<Store>,
    last_applied: RwLock<Option<LogId<RaftNodeId>>>,
    last_membership: RwLock<RaftMembership>,
}

impl StoreStateMachine {
    /// Creates a state machine over the given store.
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            last_applied: RwLock::new(None),
            last_membership: RwLock::new(StoredMembership::default()),
        }
    }

    async fn snapshot_data(&self) -> Result<SnapshotData, StorageError<RaftNodeId>> {
        let state = self.store.snapshot_bytes().map_err(write_error)?;
        Ok(SnapshotData {
            last_applied: *self.last_applied.read().await,
            last_membership: self.last_membership.read().await.clone(),
            state,
        })
    }
}

/// Snapshot builder capturing a point-in-time dump of the store.
pub struct StoreSnapshotBuilder {
    data: SnapshotData,
}

impl RaftSnapshotBuilder<TypeConfig> for StoreSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<RaftNodeId>> {
        let serialized = bincode::serialize(&self.data).map_err(write_error)?;

        let snapshot_id = format!(
            "{}-{}",
            self.data.last_applied.map_or(0, |l| l.index),
            Utc::now().timestamp_millis()
        );

        let meta = SnapshotMeta {
            last_log_id: self.data.last_applied,
            last_membership: self.data.last_membership.clone(),
            snapshot_id,
        };

        Ok(Snapshot { meta, snapshot: Box::new(Cursor::new(serialized)) })
    }
}

impl RaftStateMachine<TypeConfig> for StoreStateMachine {
    type SnapshotBuilder = StoreSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<
        (Option<LogId<RaftNodeId>>, StoredMembership<RaftNodeId, openraft::BasicNode>),
        StorageError<RaftNodeId>,
    > {
        let last_applied = *self.last_applied.read().await;
        let last_membership = self.last_membership.read().await.clone();
        Ok((last_applied, last_membership))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<CommandResponse>, StorageError<RaftNodeId>>
    where
        I: IntoIterator<Item = openraft::Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut responses = Vec::new();

        for entry in entries {
            *self.last_applied.write().await = Some(entry.log_id);

            match entry.payload {
                EntryPayload::Blank => {
                    responses.push(CommandResponse::Ok);
                }
                EntryPayload::Normal(stamped) => {
                    // The timestamp travels in the entry; apply never
                    // reads the clock, so replay is deterministic.
                    let response = match self.store.apply(&stamped.command, stamped.at) {
                        Ok(()) => CommandResponse::Ok,
                        Err(e) => CommandResponse::from_error(&e),
                    };
                    responses.push(response);
                }
                EntryPayload::Membership(membership) => {
                    *self.last_membership.write().await =
                        StoredMembership::new(Some(entry.log_id), membership);
                    responses.push(CommandResponse::Ok);
                }
            }
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        let data = self.snapshot_data().await.unwrap_or(SnapshotData {
            last_applied: None,
            last_membership: StoredMembership::default(),
            state: Vec::new(),
        });
        StoreSnapshotBuilder { data }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<RaftNodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &RaftSnapshotMeta,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let data: SnapshotData = bincode::deserialize(snapshot.get_ref()).map_err(read_error)?;

        self.store.restore(&data.state).map_err(read_error)?;

        *self.last_applied.write().await = data.last_applied;
        *self.last_membership.write().await = meta.last_membership.clone();

        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<RaftNodeId>> {
        let last_applied = *self.last_applied.read().await;
        if last_applied.is_none() {
            return Ok(None);
        }

        let data = self.snapshot_data().await?;
        let serialized = bincode::serialize(&data).map_err(write_error)?;

        let snapshot_id = format!("{}-current", last_applied.map_or(0, |l| l.index));
        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: data.last_membership.clone(),
            snapshot_id,
        };

        Ok(Some(Snapshot { meta, snapshot: Box::new(Cursor::new(serialized)) }))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use fleetcast_core::process::ProcessConfig;

    use super::*;
    use crate::command::{Command, StampedCommand};

    fn entry(index: u64, cmd: Command) -> openraft::Entry<TypeConfig> {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        openraft::Entry {
            log_id: LogId::new(openraft::CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(StampedCommand { at, command: cmd }),
        }
    }

    #[tokio::test]
    async fn test_apply_updates_store_and_log_id() {
        let store = Arc::new(Store::new());
        let mut sm = StoreStateMachine::new(store.clone());

        let responses = sm
            .apply(vec![entry(
                1,
                Command::AddProcess {
                    config: ProcessConfig {
                        id: "p1".to_string(),
                        domain: "d".to_string(),
                        ..Default::default()
                    },
                },
            )])
            .await
            .unwrap();

        assert!(responses[0].is_ok());
        assert_eq!(store.process_list().len(), 1);

        let (last_applied, _) = sm.applied_state().await.unwrap();
        assert_eq!(last_applied.map(|l| l.index), Some(1));
    }

    #[tokio::test]
    async fn test_rejected_command_yields_error_response() {
        let store = Arc::new(Store::new());
        let mut sm = StoreStateMachine::new(store);

        let cmd = Command::AddProcess {
            config: ProcessConfig { id: "p1".to_string(), ..Default::default() },
        };
        let responses =
            sm.apply(vec![entry(1, cmd.clone()), entry(2, cmd)]).await.unwrap();

        assert!(responses[0].is_ok());
        assert!(!responses[1].is_ok());
    }

    #[tokio::test]
    async fn test_snapshot_install_round_trip() {
        let store = Arc::new(Store::new());
        let mut sm = StoreStateMachine::new(store);

        sm.apply(vec![entry(
            1,
            Command::SetKv { key: "k".to_string(), value: "v".to_string() },
        )])
        .await
        .unwrap();

        let mut builder = sm.get_snapshot_builder().await;
        let snapshot = builder.build_snapshot().await.unwrap();

        let target_store = Arc::new(Store::new());
        let mut target = StoreStateMachine::new(target_store.clone());
        target.install_snapshot(&snapshot.meta, snapshot.snapshot).await.unwrap();

        assert_eq!(target_store.kv_get("k").unwrap().value, "v");
        let (last_applied, _) = target.applied_state().await.unwrap();
        assert_eq!(last_applied.map(|l| l.index), Some(1));
    }
}
