//! Durable Raft log on redb.
//!
//! One single-file database per node (`raftlog.db` inside the cluster data
//! directory) holds the log entries plus the stable metadata the raft
//! protocol needs across restarts: the vote, the committed log id and the
//! last purged log id. Entries are JSON-encoded; command payloads carry
//! arbitrary JSON values, which rules out non-self-describing codecs.

use std::fmt::Debug;
use std::io;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;

use openraft::storage::{LogFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{ErrorSubject, ErrorVerb, LogId, OptionalSend, StorageError, Vote};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};

use crate::types::{RaftEntry, RaftLogId, RaftNodeId, RaftVote, TypeConfig};

/// Log entries, keyed by log index.
const LOG_TABLE: TableDefinition<'static, u64, &'static [u8]> = TableDefinition::new("log");

/// Stable raft metadata.
const META_TABLE: TableDefinition<'static, &'static str, &'static [u8]> =
    TableDefinition::new("meta");

const KEY_VOTE: &str = "vote";
const KEY_COMMITTED: &str = "committed";
const KEY_PURGED: &str = "purged";

/// File name of the raft log database inside the cluster data directory.
pub const RAFT_LOG_FILE: &str = "raftlog.db";

/// Error type for log store operations.
#[derive(Debug, thiserror::Error)]
pub enum LogStoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl LogStoreError {
    fn db<E: std::error::Error>(e: E) -> Self {
        Self::Database(e.to_string())
    }

    fn codec(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

fn storage_error(
    subject: ErrorSubject<RaftNodeId>,
    verb: ErrorVerb,
    e: LogStoreError,
) -> StorageError<RaftNodeId> {
    StorageError::from_io_error(subject, verb, io::Error::other(e.to_string()))
}

/// Durable Raft log backed by redb.
pub struct RedbLogStorage {
    db: Arc<Database>,
    last_purged: RwLock<Option<RaftLogId>>,
    last_log_id: RwLock<Option<RaftLogId>>,
}

impl RedbLogStorage {
    /// Opens (or creates) the raft log inside the given data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the database
    /// cannot be opened. This failure is fatal at boot.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, LogStoreError> {
        std::fs::create_dir_all(dir.as_ref())
            .map_err(|e| LogStoreError::Database(e.to_string()))?;

        let db = Database::create(dir.as_ref().join(RAFT_LOG_FILE)).map_err(LogStoreError::db)?;

        let txn = db.begin_write().map_err(LogStoreError::db)?;
        {
            let _ = txn.open_table(LOG_TABLE).map_err(LogStoreError::db)?;
            let _ = txn.open_table(META_TABLE).map_err(LogStoreError::db)?;
        }
        txn.commit().map_err(LogStoreError::db)?;

        let store = Self {
            db: Arc::new(db),
            last_purged: RwLock::new(None),
            last_log_id: RwLock::new(None),
        };
        let (purged, last) = store.log_bounds()?;
        *store.last_purged.write() = purged;
        *store.last_log_id.write() = last;

        Ok(store)
    }

    fn read_meta<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, LogStoreError> {
        let txn = self.db.begin_read().map_err(LogStoreError::db)?;
        let table = txn.open_table(META_TABLE).map_err(LogStoreError::db)?;
        match table.get(key).map_err(LogStoreError::db)? {
            Some(data) => {
                Ok(Some(serde_json::from_slice(data.value()).map_err(LogStoreError::codec)?))
            }
            None => Ok(None),
        }
    }

    fn write_meta<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), LogStoreError> {
        let txn = self.db.begin_write().map_err(LogStoreError::db)?;
        {
            let mut table = txn.open_table(META_TABLE).map_err(LogStoreError::db)?;
            let data = serde_json::to_vec(value).map_err(LogStoreError::codec)?;
            table.insert(key, data.as_slice()).map_err(LogStoreError::db)?;
        }
        txn.commit().map_err(LogStoreError::db)?;
        Ok(())
    }

    fn entries(
        &self,
        range: impl RangeBounds<u64>,
    ) -> Result<Vec<RaftEntry>, LogStoreError> {
        let txn = self.db.begin_read().map_err(LogStoreError::db)?;
        let table = txn.open_table(LOG_TABLE).map_err(LogStoreError::db)?;

        let mut entries = Vec::new();
        for item in table.range(range).map_err(LogStoreError::db)? {
            let (_, value) = item.map_err(LogStoreError::db)?;
            entries.push(serde_json::from_slice(value.value()).map_err(LogStoreError::codec)?);
        }
        Ok(entries)
    }

    fn delete_range(&self, range: impl RangeBounds<u64>) -> Result<(), LogStoreError> {
        let txn = self.db.begin_write().map_err(LogStoreError::db)?;
        {
            let mut table = txn.open_table(LOG_TABLE).map_err(LogStoreError::db)?;
            let keys: Vec<u64> = table
                .range(range)
                .map_err(LogStoreError::db)?
                .map(|item| item.map(|(k, _)| k.value()))
                .collect::<Result<_, _>>()
                .map_err(LogStoreError::db)?;
            for key in keys {
                table.remove(key).map_err(LogStoreError::db)?;
            }
        }
        txn.commit().map_err(LogStoreError::db)?;
        Ok(())
    }

    fn append_all(&self, entries: &[RaftEntry]) -> Result<(), LogStoreError> {
        if entries.is_empty() {
            return Ok(());
        }

        let txn = self.db.begin_write().map_err(LogStoreError::db)?;
        {
            let mut table = txn.open_table(LOG_TABLE).map_err(LogStoreError::db)?;
            for entry in entries {
                let data = serde_json::to_vec(entry).map_err(LogStoreError::codec)?;
                table.insert(entry.log_id.index, data.as_slice()).map_err(LogStoreError::db)?;
            }
        }
        txn.commit().map_err(LogStoreError::db)?;
        Ok(())
    }

    /// Returns `(last_purged, last_log_id)` straight from the database.
    fn log_bounds(&self) -> Result<(Option<RaftLogId>, Option<RaftLogId>), LogStoreError> {
        let last_purged: Option<RaftLogId> = self.read_meta(KEY_PURGED)?;

        let txn = self.db.begin_read().map_err(LogStoreError::db)?;
        let table = txn.open_table(LOG_TABLE).map_err(LogStoreError::db)?;
        let last_log_id = match table.last().map_err(LogStoreError::db)? {
            Some((_, value)) => {
                let entry: RaftEntry =
                    serde_json::from_slice(value.value()).map_err(LogStoreError::codec)?;
                Some(entry.log_id)
            }
            None => last_purged,
        };

        Ok((last_purged, last_log_id))
    }
}

/// Cloneable reader handed to replication tasks.
#[derive(Clone)]
pub struct RedbLogReader {
    db: Arc<Database>,
}

impl RaftLogReader<TypeConfig> for RedbLogReader {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<RaftEntry>, StorageError<RaftNodeId>> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Read, LogStoreError::db(e)))?;
        let table = txn
            .open_table(LOG_TABLE)
            .map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Read, LogStoreError::db(e)))?;

        let mut entries = Vec::new();
        for item in table
            .range(range)
            .map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Read, LogStoreError::db(e)))?
        {
            let (_, value) = item.map_err(|e| {
                storage_error(ErrorSubject::Logs, ErrorVerb::Read, LogStoreError::db(e))
            })?;
            entries.push(serde_json::from_slice(value.value()).map_err(|e| {
                storage_error(ErrorSubject::Logs, ErrorVerb::Read, LogStoreError::codec(e))
            })?);
        }
        Ok(entries)
    }
}

impl RaftLogReader<TypeConfig> for RedbLogStorage {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<RaftEntry>, StorageError<RaftNodeId>> {
        self.entries(range).map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Read, e))
    }
}

impl RaftLogStorage<TypeConfig> for RedbLogStorage {
    type LogReader = RedbLogReader;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<RaftNodeId>> {
        let (last_purged, last_log_id) = self
            .log_bounds()
            .map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Read, e))?;

        *self.last_purged.write() = last_purged;
        *self.last_log_id.write() = last_log_id;

        Ok(LogState { last_purged_log_id: last_purged, last_log_id })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        RedbLogReader { db: self.db.clone() }
    }

    async fn save_vote(&mut self, vote: &Vote<RaftNodeId>) -> Result<(), StorageError<RaftNodeId>> {
        self.write_meta(KEY_VOTE, vote)
            .map_err(|e| storage_error(ErrorSubject::Vote, ErrorVerb::Write, e))
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<RaftNodeId>>, StorageError<RaftNodeId>> {
        let vote: Option<RaftVote> = self
            .read_meta(KEY_VOTE)
            .map_err(|e| storage_error(ErrorSubject::Vote, ErrorVerb::Read, e))?;
        Ok(vote)
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<RaftNodeId>>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        match committed {
            Some(log_id) => self
                .write_meta(KEY_COMMITTED, &log_id)
                .map_err(|e| storage_error(ErrorSubject::Store, ErrorVerb::Write, e)),
            None => Ok(()),
        }
    }

    async fn read_committed(
        &mut self,
    ) -> Result<Option<LogId<RaftNodeId>>, StorageError<RaftNodeId>> {
        self.read_meta(KEY_COMMITTED)
            .map_err(|e| storage_error(ErrorSubject::Store, ErrorVerb::Read, e))
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<RaftNodeId>>
    where
        I: IntoIterator<Item = RaftEntry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let entries: Vec<RaftEntry> = entries.into_iter().collect();

        if let Some(last) = entries.last() {
            *self.last_log_id.write() = Some(last.log_id);
        }

        self.append_all(&entries)
            .map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Write, e))?;

        // redb syncs on commit, so the entries are durable here.
        callback.log_io_completed(Ok(()));

        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<RaftNodeId>) -> Result<(), StorageError<RaftNodeId>> {
        self.delete_range(log_id.index..)
            .map_err(|e| storage_error(ErrorSubject::Log(log_id), ErrorVerb::Delete, e))?;

        let (last_purged, last_log_id) = self
            .log_bounds()
            .map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Read, e))?;
        *self.last_purged.write() = last_purged;
        *self.last_log_id.write() = last_log_id;

        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<RaftNodeId>) -> Result<(), StorageError<RaftNodeId>> {
        self.delete_range(..=log_id.index)
            .map_err(|e| storage_error(ErrorSubject::Log(log_id), ErrorVerb::Delete, e))?;
        self.write_meta(KEY_PURGED, &log_id)
            .map_err(|e| storage_error(ErrorSubject::Store, ErrorVerb::Write, e))?;

        *self.last_purged.write() = Some(log_id);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use openraft::{CommittedLeaderId, EntryPayload};
    use tempfile::TempDir;

    use super::*;

    fn entry(index: u64, term: u64) -> RaftEntry {
        openraft::Entry {
            log_id: LogId::new(CommittedLeaderId::new(term, 1), index),
            payload: EntryPayload::Blank,
        }
    }

    #[test]
    fn test_open_creates_file() {
        let dir = TempDir::new().unwrap();
        let _store = RedbLogStorage::open(dir.path()).unwrap();
        assert!(dir.path().join(RAFT_LOG_FILE).exists());
    }

    #[test]
    fn test_vote_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();

        {
            let store = RedbLogStorage::open(dir.path()).unwrap();
            store.write_meta(KEY_VOTE, &Vote::<RaftNodeId>::new(3, 1)).unwrap();
        }

        let store = RedbLogStorage::open(dir.path()).unwrap();
        let vote: Option<RaftVote> = store.read_meta(KEY_VOTE).unwrap();
        assert_eq!(vote, Some(Vote::new(3, 1)));
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let store = RedbLogStorage::open(dir.path()).unwrap();

        store.append_all(&[entry(1, 1), entry(2, 1), entry(3, 2)]).unwrap();

        let all = store.entries(..).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].log_id.index, 3);

        let middle = store.entries(2..3).unwrap();
        assert_eq!(middle.len(), 1);
        assert_eq!(middle[0].log_id.index, 2);
    }

    #[test]
    fn test_truncate_drops_tail() {
        let dir = TempDir::new().unwrap();
        let store = RedbLogStorage::open(dir.path()).unwrap();

        store.append_all(&[entry(1, 1), entry(2, 1), entry(3, 2)]).unwrap();
        store.delete_range(2u64..).unwrap();

        let all = store.entries(..).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].log_id.index, 1);
    }

    #[test]
    fn test_purge_drops_head_and_records_bound() {
        let dir = TempDir::new().unwrap();
        let store = RedbLogStorage::open(dir.path()).unwrap();

        store.append_all(&[entry(1, 1), entry(2, 1), entry(3, 2)]).unwrap();

        let purge_id = LogId::new(CommittedLeaderId::new(1, 1), 2);
        store.delete_range(..=purge_id.index).unwrap();
        store.write_meta(KEY_PURGED, &purge_id).unwrap();

        let (purged, last) = store.log_bounds().unwrap();
        assert_eq!(purged, Some(purge_id));
        assert_eq!(last.map(|l| l.index), Some(3));

        let all = store.entries(..).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].log_id.index, 3);
    }

    #[test]
    fn test_empty_log_bounds() {
        let dir = TempDir::new().unwrap();
        let store = RedbLogStorage::open(dir.path()).unwrap();

        let (purged, last) = store.log_bounds().unwrap();
        assert!(purged.is_none());
        assert!(last.is_none());
    }
}
