//! Field-map key-value store.
//!
//! Each record is a string key holding a map of string fields. Two
//! backends share this shape: a SQLite file for a single host, and Redis
//! hashes for instances spread over several hosts.

mod remote;
mod sqlite;

pub use remote::RedisKv;
pub use sqlite::{Fields, SqliteKv};

use super::StoreError;
use std::collections::BTreeMap;
use std::path::Path;

pub type FieldMap = BTreeMap<String, String>;

/// Handle to the shared store. Clones share one connection.
#[derive(Clone)]
pub enum KvStore {
    Sqlite(SqliteKv),
    Redis(RedisKv),
}

impl KvStore {
    /// Open a file-backed store. Several processes may open the same file.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        SqliteKv::open(path).map(Self::Sqlite)
    }

    /// Create an in-memory store (for testing).
    pub fn memory() -> Result<Self, StoreError> {
        SqliteKv::memory().map(Self::Sqlite)
    }

    /// Connect to a Redis server.
    pub fn connect(host: &str, port: u16, password: Option<&str>) -> Result<Self, StoreError> {
        RedisKv::connect(host, port, password).map(Self::Redis)
    }

    pub fn backend(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::Redis(_) => "redis",
        }
    }

    pub fn ping(&self) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(db) => db.ping(),
            Self::Redis(db) => db.ping(),
        }
    }

    /// Later calls fail with [`StoreError::Closed`]; closing twice is a
    /// no-op.
    pub fn close(&self) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(db) => db.close(),
            Self::Redis(db) => db.close(),
        }
    }

    /// All fields of `key`, or `None` if the key does not exist.
    pub fn get_fields(&self, key: &str) -> Result<Option<FieldMap>, StoreError> {
        match self {
            Self::Sqlite(db) => db.get_fields(key),
            Self::Redis(db) => db.get_fields(key),
        }
    }

    /// Upsert the given fields of `key` in one atomic write, creating the
    /// key if needed.
    pub fn set_fields(&self, key: &str, fields: &FieldMap) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(db) => db.set_fields(key, fields),
            Self::Redis(db) => db.set_fields(key, fields),
        }
    }

    /// Remove `key` and all its fields. Returns whether the key existed.
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        match self {
            Self::Sqlite(db) => db.delete(key),
            Self::Redis(db) => db.delete(key),
        }
    }

    /// One step of a cursor scan over keys matching a glob `pattern`.
    ///
    /// Start with cursor `0`; a returned cursor of `0` ends the iteration.
    pub fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(Vec<String>, u64), StoreError> {
        match self {
            Self::Sqlite(db) => db.scan(cursor, pattern, count),
            Self::Redis(db) => db.scan(cursor, pattern, count),
        }
    }

    /// Glob matching every key under `prefix`, escaped for this backend.
    pub fn prefix_pattern(&self, prefix: &str) -> String {
        let escaped = match self {
            Self::Sqlite(_) => sqlite::glob_escape(prefix),
            Self::Redis(_) => remote::glob_escape(prefix),
        };
        format!("{escaped}*")
    }
}

impl From<SqliteKv> for KvStore {
    fn from(db: SqliteKv) -> Self {
        Self::Sqlite(db)
    }
}

impl From<RedisKv> for KvStore {
    fn from(db: RedisKv) -> Self {
        Self::Redis(db)
    }
}
