//! SQLite implementation of the engine's backing-store seam.
//!
//! Rows are spread across a fixed set of sharded tables inside one database
//! file; every statement goes through the connection's prepared-statement
//! cache.

use std::path::PathBuf;

use rusqlite::{params, Connection, ErrorCode};
use tracing::debug;

use everstore_store::{Item, KVStore, StorageError, StorageResult};

pub const DEFAULT_SHARDS: usize = 4;

#[derive(Clone, Debug)]
pub enum DatabaseLocation {
    InMemory,
    Path(PathBuf),
}

/// A `KVStore` backed by SQLite with `n_shards` tables named `kv_0..`.
/// Which table a key lands in is a pure function of the key, so lookups and
/// deletes touch exactly one table and `dump` walks them all.
pub struct SqliteKVStore {
    connection: Connection,
    n_shards: usize,
}

impl SqliteKVStore {
    /// Open (creating if needed) the database and its shard tables, and
    /// apply `init_script` if one is configured.
    pub fn open(
        location: DatabaseLocation,
        n_shards: usize,
        init_script: Option<&str>,
    ) -> StorageResult<Self> {
        assert!(n_shards > 0, "need at least one shard table");
        let connection = match &location {
            DatabaseLocation::InMemory => Connection::open_in_memory(),
            DatabaseLocation::Path(path) => Connection::open(path),
        }
        .map_err(sqlite_error)?;

        if let Some(script) = init_script {
            connection.execute_batch(script).map_err(sqlite_error)?;
        }

        for shard in 0..n_shards {
            connection
                .execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS kv_{shard} (
                         k       TEXT PRIMARY KEY,
                         v       BLOB NOT NULL,
                         flags   INTEGER NOT NULL,
                         exptime INTEGER NOT NULL,
                         cas     INTEGER NOT NULL
                     )"
                ))
                .map_err(sqlite_error)?;
        }

        debug!(?location, n_shards, "opened sqlite backing store");
        Ok(Self {
            connection,
            n_shards,
        })
    }

    fn shard(&self, key: &str) -> usize {
        let mut h: u32 = 5381;
        for &byte in key.as_bytes() {
            h = h.wrapping_shl(5).wrapping_add(h) ^ u32::from(byte);
        }
        h as usize % self.n_shards
    }
}

impl KVStore for SqliteKVStore {
    fn begin(&mut self) -> StorageResult<()> {
        self.connection
            .execute_batch("BEGIN")
            .map_err(sqlite_error)
    }

    fn set(&mut self, item: &Item) -> StorageResult<()> {
        let shard = self.shard(item.key());
        self.connection
            .prepare_cached(&format!(
                "INSERT OR REPLACE INTO kv_{shard} (k, v, flags, exptime, cas)
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            ))
            .map_err(sqlite_error)?
            .execute(params![
                item.key(),
                item.data(),
                item.flags(),
                item.exptime() as i64,
                item.cas() as i64,
            ])
            .map_err(sqlite_error)
            .map(drop)
    }

    fn del(&mut self, key: &str) -> StorageResult<()> {
        let shard = self.shard(key);
        self.connection
            .prepare_cached(&format!("DELETE FROM kv_{shard} WHERE k = ?1"))
            .map_err(sqlite_error)?
            .execute([key])
            .map_err(sqlite_error)
            .map(drop)
    }

    fn commit(&mut self) -> StorageResult<()> {
        self.connection
            .execute_batch("COMMIT")
            .map_err(sqlite_error)
    }

    fn dump(&mut self, load: &mut dyn FnMut(Item)) -> StorageResult<()> {
        for shard in 0..self.n_shards {
            let mut statement = self
                .connection
                .prepare_cached(&format!("SELECT k, v, flags, exptime, cas FROM kv_{shard}"))
                .map_err(sqlite_error)?;
            let mut rows = statement.query([]).map_err(sqlite_error)?;
            while let Some(row) = rows.next().map_err(sqlite_error)? {
                let key: String = row.get(0).map_err(sqlite_error)?;
                let value: Vec<u8> = row.get(1).map_err(sqlite_error)?;
                let flags: u32 = row.get(2).map_err(sqlite_error)?;
                let exptime: i64 = row.get(3).map_err(sqlite_error)?;
                let cas: i64 = row.get(4).map_err(sqlite_error)?;
                load(Item::from_stored(
                    key,
                    value,
                    flags,
                    exptime as u64,
                    cas as u64,
                ));
            }
        }
        Ok(())
    }
}

fn sqlite_error(error: rusqlite::Error) -> StorageError {
    match &error {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::DatabaseBusy
                || failure.code == ErrorCode::DatabaseLocked =>
        {
            StorageError::Busy
        }
        _ => StorageError::Failure(error.to_string()),
    }
}
