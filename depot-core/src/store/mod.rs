//! Namespaced key-value store.
//!
//! One SQLite database backs every domain; each domain sees its own keyspace
//! through a [`NamespaceStore`] that prefixes keys with a single namespace
//! byte. Writes are not fsynced: the raft log above this layer is the
//! recovery source, and a lost tail is replayed from it.

pub mod range_file;

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use range_file::{RangeEntry, decode_entries, encode_entries, read_range_file, write_range_file};

pub struct Store {
    db_path: PathBuf,
}

impl Store {
    pub fn open(db_path: PathBuf) -> Result<Arc<Self>> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self { db_path };
        store.init_schema()?;
        Ok(Arc::new(store))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn namespace(self: &Arc<Self>, prefix: u8) -> NamespaceStore {
        NamespaceStore {
            store: Arc::clone(self),
            prefix,
        }
    }

    fn open_connection(&self) -> std::result::Result<Connection, rusqlite::Error> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "MEMORY")?;
        conn.pragma_update(None, "synchronous", "OFF")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.open_connection()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
              k BLOB PRIMARY KEY,
              v BLOB NOT NULL
            ) WITHOUT ROWID;
            ",
        )?;
        Ok(())
    }
}

/// View of the store restricted to one namespace byte. Keys passed in and
/// handed out are namespace-relative.
#[derive(Clone)]
pub struct NamespaceStore {
    store: Arc<Store>,
    prefix: u8,
}

impl NamespaceStore {
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let conn = self.store.open_connection()?;
        conn.execute(
            "INSERT INTO kv(k, v) VALUES (?1, ?2) ON CONFLICT(k) DO UPDATE SET v=excluded.v",
            params![self.full_key(key), value],
        )?;
        Ok(())
    }

    /// Writes every pair in one transaction.
    pub fn mput<I, K, V>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut conn = self.store.open_connection()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO kv(k, v) VALUES (?1, ?2) ON CONFLICT(k) DO UPDATE SET v=excluded.v",
            )?;
            for (key, value) in entries {
                stmt.execute(params![self.full_key(key.as_ref()), value.as_ref()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let conn = self.store.open_connection()?;
        let value = conn
            .query_row(
                "SELECT v FROM kv WHERE k=?1",
                params![self.full_key(key)],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn remove(&self, key: &[u8]) -> Result<()> {
        let conn = self.store.open_connection()?;
        conn.execute("DELETE FROM kv WHERE k=?1", params![self.full_key(key)])?;
        Ok(())
    }

    /// Removes every key in one transaction.
    pub fn mremove<I, K>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let mut conn = self.store.open_connection()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM kv WHERE k=?1")?;
            for key in keys {
                stmt.execute(params![self.full_key(key.as_ref())])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Visits keys starting with `prefix` in ascending order until the
    /// visitor returns `false`. Returns the number of visited entries.
    pub fn scan<F>(&self, prefix: &[u8], mut visitor: F) -> Result<usize>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let conn = self.store.open_connection()?;
        let lower = self.full_key(prefix);
        let upper = upper_bound(&lower);

        let mut stmt;
        let mut rows = match &upper {
            Some(upper) => {
                stmt = conn.prepare("SELECT k, v FROM kv WHERE k >= ?1 AND k < ?2 ORDER BY k ASC")?;
                stmt.query(params![lower, upper])?
            }
            None => {
                stmt = conn.prepare("SELECT k, v FROM kv WHERE k >= ?1 ORDER BY k ASC")?;
                stmt.query(params![lower])?
            }
        };

        let mut visited = 0;
        while let Some(row) = rows.next()? {
            let key: Vec<u8> = row.get(0)?;
            let value: Vec<u8> = row.get(1)?;
            visited += 1;
            if !visitor(&key[1..], &value) {
                break;
            }
        }

        Ok(visited)
    }

    /// Exports the whole namespace into one immutable range file.
    pub fn dump(&self, path: &Path) -> Result<u64> {
        let mut entries: Vec<RangeEntry> = Vec::new();
        self.scan(&[], |key, value| {
            entries.push((key.to_vec(), value.to_vec()));
            true
        })?;

        let count = write_range_file(path, entries)?;
        tracing::debug!(
            namespace = self.prefix,
            count,
            path = %path.display(),
            "dumped namespace range"
        );
        Ok(count)
    }

    /// Ingests a range file produced by [`NamespaceStore::dump`].
    pub fn load(&self, path: &Path) -> Result<u64> {
        let entries = read_range_file(path)?;
        let count = entries.len() as u64;
        self.mput(entries)?;
        tracing::debug!(
            namespace = self.prefix,
            count,
            path = %path.display(),
            "loaded namespace range"
        );
        Ok(count)
    }

    /// Deletes every key of the namespace.
    pub fn clean(&self) -> Result<usize> {
        let conn = self.store.open_connection()?;
        let lower = vec![self.prefix];
        let removed = match upper_bound(&lower) {
            Some(upper) => conn.execute("DELETE FROM kv WHERE k >= ?1 AND k < ?2", params![lower, upper])?,
            None => conn.execute("DELETE FROM kv WHERE k >= ?1", params![lower])?,
        };
        Ok(removed)
    }

    pub fn count(&self) -> Result<usize> {
        self.scan(&[], |_key, _value| true)
    }

    fn full_key(&self, key: &[u8]) -> Vec<u8> {
        let mut full = Vec::with_capacity(key.len() + 1);
        full.push(self.prefix);
        full.extend_from_slice(key);
        full
    }
}

/// Smallest key greater than every key starting with `prefix`, or `None` when
/// the prefix is all `0xff`.
fn upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &tempfile::TempDir) -> Arc<Store> {
        Store::open(dir.path().join("store.sqlite3")).unwrap()
    }

    #[test]
    fn put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).namespace(0x02);

        store.put(b"k1", b"v1").unwrap();
        assert_eq!(store.get(b"k1").unwrap(), Some(b"v1".to_vec()));

        store.put(b"k1", b"v2").unwrap();
        assert_eq!(store.get(b"k1").unwrap(), Some(b"v2".to_vec()));

        store.remove(b"k1").unwrap();
        assert_eq!(store.get(b"k1").unwrap(), None);
    }

    #[test]
    fn namespaces_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let shared = open_store(&dir);
        let dict = shared.namespace(0x02);
        let plugin = shared.namespace(0x03);

        dict.put(b"same", b"dict").unwrap();
        plugin.put(b"same", b"plugin").unwrap();

        assert_eq!(dict.get(b"same").unwrap(), Some(b"dict".to_vec()));
        assert_eq!(plugin.get(b"same").unwrap(), Some(b"plugin".to_vec()));

        assert_eq!(dict.clean().unwrap(), 1);
        assert_eq!(dict.count().unwrap(), 0);
        assert_eq!(plugin.count().unwrap(), 1);
    }

    #[test]
    fn scan_is_ordered_prefix_bounded_and_stoppable() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).namespace(0xff);

        store
            .mput(vec![
                (b"b/2".to_vec(), b"x".to_vec()),
                (b"a/1".to_vec(), b"x".to_vec()),
                (b"b/1".to_vec(), b"x".to_vec()),
                (b"c".to_vec(), b"x".to_vec()),
            ])
            .unwrap();

        let mut seen = Vec::new();
        store
            .scan(b"b/", |key, _value| {
                seen.push(key.to_vec());
                true
            })
            .unwrap();
        assert_eq!(seen, vec![b"b/1".to_vec(), b"b/2".to_vec()]);

        let visited = store.scan(&[], |_key, _value| false).unwrap();
        assert_eq!(visited, 1);
        assert_eq!(store.count().unwrap(), 4);
    }

    #[test]
    fn mremove_deletes_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).namespace(0x01);

        store
            .mput(vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())])
            .unwrap();
        store.mremove(vec![b"a".to_vec(), b"b".to_vec()]).unwrap();
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn dump_clean_load_restores_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let shared = open_store(&dir);
        let store = shared.namespace(0x02);
        let other = shared.namespace(0x03);

        store
            .mput(vec![(b"x".to_vec(), b"1".to_vec()), (b"y".to_vec(), b"2".to_vec())])
            .unwrap();
        other.put(b"z", b"3").unwrap();

        let path = dir.path().join("snap").join("dict.range");
        assert_eq!(store.dump(&path).unwrap(), 2);

        store.clean().unwrap();
        assert_eq!(store.count().unwrap(), 0);

        assert_eq!(store.load(&path).unwrap(), 2);
        assert_eq!(store.get(b"x").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"y").unwrap(), Some(b"2".to_vec()));
        assert_eq!(other.count().unwrap(), 1);
    }

    #[test]
    fn upper_bound_handles_max_bytes() {
        assert_eq!(upper_bound(&[0x01]), Some(vec![0x02]));
        assert_eq!(upper_bound(&[0x01, 0xff]), Some(vec![0x02]));
        assert_eq!(upper_bound(&[0xff, 0xff]), None);
    }
}
