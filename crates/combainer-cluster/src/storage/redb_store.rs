//! redb-backed raft log
//!
//! Entries are keyed by log index. Hard state is kept in a second table and
//! cached in memory; the cache is shared with every log reader handed to
//! openraft so readers never see a stale vote or purge point.

#![allow(clippy::result_large_err)]

use crate::error::{ClusterError, Result};
use crate::raft::{NodeId, RaftEntry, RaftLogId, RaftVote, TypeConfig};
use openraft::storage::{LogFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{AnyError, StorageError, StorageIOError};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::ops::{Bound, RangeBounds};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

const LOGS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("raft_logs");
const STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("raft_state");

const KEY_VOTE: &str = "vote";
const KEY_LAST_PURGED: &str = "last_purged";
const KEY_COMMITTED: &str = "committed";

type StorageResult<T> = std::result::Result<T, StorageError<NodeId>>;

fn read_err<E: std::error::Error + 'static>(e: E) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::read_logs(AnyError::new(&e)),
    }
}

fn write_err<E: std::error::Error + 'static>(e: E) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::write_logs(AnyError::new(&e)),
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct HardState {
    vote: Option<RaftVote>,
    last_purged: Option<RaftLogId>,
    committed: Option<RaftLogId>,
}

/// Raft log storage on a single redb file
#[derive(Clone)]
pub struct RedbLogStore {
    db: Arc<Database>,
    hard_state: Arc<RwLock<HardState>>,
}

impl RedbLogStore {
    /// Open (or create) the log at `path`. Parent directories are created.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ClusterError::RaftStorage(format!("create {}: {}", parent.display(), e))
            })?;
        }

        let db = Database::create(path)
            .map_err(|e| ClusterError::RaftStorage(format!("open redb: {}", e)))?;

        let txn = db
            .begin_write()
            .map_err(|e| ClusterError::RaftStorage(e.to_string()))?;
        txn.open_table(LOGS_TABLE)
            .map_err(|e| ClusterError::RaftStorage(e.to_string()))?;
        txn.open_table(STATE_TABLE)
            .map_err(|e| ClusterError::RaftStorage(e.to_string()))?;
        txn.commit()
            .map_err(|e| ClusterError::RaftStorage(e.to_string()))?;

        let hard_state = HardState {
            vote: load_state(&db, KEY_VOTE)?,
            last_purged: load_state(&db, KEY_LAST_PURGED)?,
            committed: load_state(&db, KEY_COMMITTED)?,
        };

        info!(
            path = %path.display(),
            vote = ?hard_state.vote,
            last_purged = ?hard_state.last_purged,
            committed = ?hard_state.committed,
            "Opened raft log"
        );

        Ok(Self {
            db: Arc::new(db),
            hard_state: Arc::new(RwLock::new(hard_state)),
        })
    }

    fn put_state<T: Serialize>(&self, key: &str, value: &T) -> StorageResult<()> {
        let bytes = postcard::to_allocvec(value).map_err(write_err)?;
        let txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut table = txn.open_table(STATE_TABLE).map_err(write_err)?;
            table.insert(key, bytes.as_slice()).map_err(write_err)?;
        }
        txn.commit().map_err(write_err)
    }

    fn last_entry(&self) -> StorageResult<Option<RaftEntry>> {
        let txn = self.db.begin_read().map_err(read_err)?;
        let table = txn.open_table(LOGS_TABLE).map_err(read_err)?;
        let entry = match table.last().map_err(read_err)? {
            Some((_, value)) => postcard::from_bytes(value.value())
                .map(Some)
                .map_err(read_err),
            None => Ok(None),
        };
        entry
    }

    fn read_range(&self, range: (Bound<u64>, Bound<u64>)) -> StorageResult<Vec<RaftEntry>> {
        let txn = self.db.begin_read().map_err(read_err)?;
        let table = txn.open_table(LOGS_TABLE).map_err(read_err)?;

        let mut entries = Vec::new();
        let mut expected: Option<u64> = None;
        for item in table.range(range).map_err(read_err)? {
            let (key, value) = item.map_err(read_err)?;
            // stop at the first hole
            if expected.is_some_and(|e| e != key.value()) {
                break;
            }
            expected = Some(key.value() + 1);
            entries.push(postcard::from_bytes(value.value()).map_err(read_err)?);
        }
        Ok(entries)
    }

    fn write_entries(&self, entries: &[RaftEntry]) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut table = txn.open_table(LOGS_TABLE).map_err(write_err)?;
            for entry in entries {
                let bytes = postcard::to_allocvec(entry).map_err(write_err)?;
                table
                    .insert(entry.log_id.index, bytes.as_slice())
                    .map_err(write_err)?;
            }
        }
        txn.commit().map_err(write_err)
    }

    /// Remove every entry with index in `range`
    fn remove_range(&self, range: (Bound<u64>, Bound<u64>)) -> StorageResult<usize> {
        let txn = self.db.begin_write().map_err(write_err)?;
        let removed = {
            let mut table = txn.open_table(LOGS_TABLE).map_err(write_err)?;
            let keys = table
                .range(range)
                .map_err(write_err)?
                .map(|item| item.map(|(k, _)| k.value()))
                .collect::<std::result::Result<Vec<u64>, _>>()
                .map_err(write_err)?;
            for key in &keys {
                table.remove(*key).map_err(write_err)?;
            }
            keys.len()
        };
        txn.commit().map_err(write_err)?;
        Ok(removed)
    }
}

fn load_state<T: DeserializeOwned>(db: &Database, key: &str) -> Result<Option<T>> {
    let txn = db
        .begin_read()
        .map_err(|e| ClusterError::RaftStorage(e.to_string()))?;
    let table = txn
        .open_table(STATE_TABLE)
        .map_err(|e| ClusterError::RaftStorage(e.to_string()))?;
    match table
        .get(key)
        .map_err(|e| ClusterError::RaftStorage(e.to_string()))?
    {
        Some(value) => Ok(Some(postcard::from_bytes(value.value()).map_err(|e| {
            ClusterError::RaftStorage(format!("corrupt raft state {}: {}", key, e))
        })?)),
        None => Ok(None),
    }
}

impl RaftLogReader<TypeConfig> for RedbLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + Send>(
        &mut self,
        range: RB,
    ) -> StorageResult<Vec<RaftEntry>> {
        self.read_range((range.start_bound().cloned(), range.end_bound().cloned()))
    }
}

impl RaftLogStorage<TypeConfig> for RedbLogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> StorageResult<LogState<TypeConfig>> {
        let last_purged = self.hard_state.read().await.last_purged;
        let last_log_id = self.last_entry()?.map(|e| e.log_id).or(last_purged);
        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &RaftVote) -> StorageResult<()> {
        self.put_state(KEY_VOTE, vote)?;
        self.hard_state.write().await.vote = Some(*vote);
        debug!(?vote, "Saved vote");
        Ok(())
    }

    async fn read_vote(&mut self) -> StorageResult<Option<RaftVote>> {
        Ok(self.hard_state.read().await.vote)
    }

    async fn save_committed(&mut self, committed: Option<RaftLogId>) -> StorageResult<()> {
        if let Some(c) = &committed {
            self.put_state(KEY_COMMITTED, c)?;
        }
        self.hard_state.write().await.committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> StorageResult<Option<RaftLogId>> {
        Ok(self.hard_state.read().await.committed)
    }

    async fn append<I>(&mut self, entries: I, callback: LogFlushed<TypeConfig>) -> StorageResult<()>
    where
        I: IntoIterator<Item = RaftEntry> + Send,
        I::IntoIter: Send,
    {
        let entries: Vec<RaftEntry> = entries.into_iter().collect();
        self.write_entries(&entries)?;
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: RaftLogId) -> StorageResult<()> {
        let removed = self.remove_range((Bound::Excluded(log_id.index), Bound::Unbounded))?;
        debug!(?log_id, removed, "Truncated log");
        Ok(())
    }

    async fn purge(&mut self, log_id: RaftLogId) -> StorageResult<()> {
        let removed = self.remove_range((Bound::Unbounded, Bound::Included(log_id.index)))?;
        self.put_state(KEY_LAST_PURGED, &log_id)?;
        self.hard_state.write().await.last_purged = Some(log_id);
        debug!(?log_id, removed, "Purged log");
        Ok(())
    }
}
