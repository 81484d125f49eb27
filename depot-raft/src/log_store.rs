//! Raft log persisted in its own SQLite database.
//!
//! The log is the recovery source of every replica, so unlike the artifact
//! store it is written with `synchronous=FULL`.

use crate::error::{RaftNodeError, Result};
use crate::types::{DepotNodeId, DepotTypeConfig};
use openraft::Entry;
use openraft::LogId;
use openraft::LogState;
use openraft::RaftLogReader;
use openraft::StorageError;
use openraft::StorageIOError;
use openraft::Vote;
use openraft::storage::LogFlushed;
use openraft::storage::RaftLogStorage;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::ops::Bound;
use std::ops::RangeBounds;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const META_KEY_VOTE: &str = "vote";
const META_KEY_COMMITTED: &str = "committed";
const META_KEY_LAST_PURGED: &str = "last_purged";

type DepotEntry = Entry<DepotTypeConfig>;

#[derive(Clone, Debug)]
pub struct SqliteLogStore {
    db_path: Arc<PathBuf>,
}

impl SqliteLogStore {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let this = Self {
            db_path: Arc::new(db_path),
        };
        this.init_schema()?;
        Ok(this)
    }

    fn open_connection(&self) -> std::result::Result<Connection, rusqlite::Error> {
        let conn = Connection::open(self.db_path.as_path())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.open_connection()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS raft_log (
              idx INTEGER PRIMARY KEY,
              entry BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS raft_meta (
              k TEXT PRIMARY KEY,
              v BLOB NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn write_meta<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let conn = self.open_connection()?;
        Self::write_meta_with(&conn, key, value)
    }

    fn write_meta_with<T: Serialize>(conn: &Connection, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_vec(value)?;
        conn.execute(
            "INSERT INTO raft_meta(k, v) VALUES (?1, ?2) ON CONFLICT(k) DO UPDATE SET v=excluded.v",
            params![key, encoded],
        )?;
        Ok(())
    }

    fn read_meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let conn = self.open_connection()?;
        let raw = conn
            .query_row("SELECT v FROM raft_meta WHERE k=?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;

        match raw {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn read_range<RB: RangeBounds<u64>>(&self, range: &RB) -> Result<Vec<DepotEntry>> {
        let Some((start, end)) = index_bounds(range) else {
            return Ok(Vec::new());
        };

        let conn = self.open_connection()?;
        let mut stmt =
            conn.prepare("SELECT entry FROM raft_log WHERE idx >= ?1 AND idx <= ?2 ORDER BY idx ASC")?;
        let raw = stmt
            .query_map(params![start, end], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        raw.iter()
            .map(|bytes| serde_json::from_slice::<DepotEntry>(bytes).map_err(RaftNodeError::from))
            .collect()
    }

    fn last_entry(&self) -> Result<Option<DepotEntry>> {
        let conn = self.open_connection()?;
        let raw = conn
            .query_row(
                "SELECT entry FROM raft_log ORDER BY idx DESC LIMIT 1",
                [],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;

        match raw {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn append_entries<I>(&self, entries: I) -> Result<u64>
    where
        I: IntoIterator<Item = DepotEntry>,
    {
        let mut conn = self.open_connection()?;
        let tx = conn.transaction()?;
        let mut appended = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO raft_log(idx, entry) VALUES (?1, ?2) ON CONFLICT(idx) DO UPDATE SET entry=excluded.entry",
            )?;
            for entry in entries {
                let encoded = serde_json::to_vec(&entry)?;
                stmt.execute(params![to_sql_index(entry.log_id.index), encoded])?;
                appended += 1;
            }
        }
        tx.commit()?;
        Ok(appended)
    }

    fn delete_from(&self, index: u64) -> Result<()> {
        let conn = self.open_connection()?;
        conn.execute(
            "DELETE FROM raft_log WHERE idx >= ?1",
            params![to_sql_index(index)],
        )?;
        Ok(())
    }

    fn purge_upto(&self, log_id: &LogId<DepotNodeId>) -> Result<()> {
        let mut conn = self.open_connection()?;
        let tx = conn.transaction()?;
        Self::write_meta_with(&tx, META_KEY_LAST_PURGED, log_id)?;
        tx.execute(
            "DELETE FROM raft_log WHERE idx <= ?1",
            params![to_sql_index(log_id.index)],
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn to_sql_index(index: u64) -> i64 {
    index.min(i64::MAX as u64) as i64
}

/// Inclusive SQL bounds of `range`, or `None` when it is empty.
fn index_bounds<RB: RangeBounds<u64>>(range: &RB) -> Option<(i64, i64)> {
    let start = match range.start_bound() {
        Bound::Included(value) => *value,
        Bound::Excluded(value) => value.checked_add(1)?,
        Bound::Unbounded => 0,
    };
    let end = match range.end_bound() {
        Bound::Included(value) => *value,
        Bound::Excluded(value) => value.checked_sub(1)?,
        Bound::Unbounded => u64::MAX,
    };

    if start > end {
        return None;
    }
    Some((to_sql_index(start), to_sql_index(end)))
}

impl RaftLogReader<DepotTypeConfig> for SqliteLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug>(
        &mut self,
        range: RB,
    ) -> std::result::Result<Vec<DepotEntry>, StorageError<DepotNodeId>> {
        let entries = self
            .read_range(&range)
            .map_err(|error| StorageIOError::read_logs(&error))?;
        Ok(entries)
    }
}

impl RaftLogStorage<DepotTypeConfig> for SqliteLogStore {
    type LogReader = Self;

    async fn get_log_state(
        &mut self,
    ) -> std::result::Result<LogState<DepotTypeConfig>, StorageError<DepotNodeId>> {
        let last_purged_log_id = self
            .read_meta::<LogId<DepotNodeId>>(META_KEY_LAST_PURGED)
            .map_err(|error| StorageIOError::read_logs(&error))?;
        let last = self
            .last_entry()
            .map_err(|error| StorageIOError::read_logs(&error))?
            .map(|entry| entry.log_id)
            .or_else(|| last_purged_log_id.clone());

        Ok(LogState {
            last_purged_log_id,
            last_log_id: last,
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<DepotNodeId>>,
    ) -> std::result::Result<(), StorageError<DepotNodeId>> {
        self.write_meta(META_KEY_COMMITTED, &committed)
            .map_err(|error| StorageIOError::write(&error))?;
        Ok(())
    }

    async fn read_committed(
        &mut self,
    ) -> std::result::Result<Option<LogId<DepotNodeId>>, StorageError<DepotNodeId>> {
        let committed = self
            .read_meta::<Option<LogId<DepotNodeId>>>(META_KEY_COMMITTED)
            .map_err(|error| StorageIOError::read(&error))?
            .flatten();
        Ok(committed)
    }

    async fn save_vote(
        &mut self,
        vote: &Vote<DepotNodeId>,
    ) -> std::result::Result<(), StorageError<DepotNodeId>> {
        self.write_meta(META_KEY_VOTE, vote)
            .map_err(|error| StorageIOError::write_vote(&error))?;
        Ok(())
    }

    async fn read_vote(
        &mut self,
    ) -> std::result::Result<Option<Vote<DepotNodeId>>, StorageError<DepotNodeId>> {
        let vote = self
            .read_meta::<Vote<DepotNodeId>>(META_KEY_VOTE)
            .map_err(|error| StorageIOError::read_vote(&error))?;
        Ok(vote)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<DepotTypeConfig>,
    ) -> std::result::Result<(), StorageError<DepotNodeId>>
    where
        I: IntoIterator<Item = DepotEntry>,
    {
        self.append_entries(entries)
            .map_err(|error| StorageIOError::write_logs(&error))?;

        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(
        &mut self,
        log_id: LogId<DepotNodeId>,
    ) -> std::result::Result<(), StorageError<DepotNodeId>> {
        self.delete_from(log_id.index)
            .map_err(|error| StorageIOError::write_logs(&error))?;
        Ok(())
    }

    async fn purge(
        &mut self,
        log_id: LogId<DepotNodeId>,
    ) -> std::result::Result<(), StorageError<DepotNodeId>> {
        self.purge_upto(&log_id)
            .map_err(|error| StorageIOError::write_logs(&error))?;
        Ok(())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }
}
