//! SQLite backend.
//!
//! Keys are enumerated with an id-ordered cursor, so a scan stays stable
//! while records are deleted underneath it.

use super::{FieldMap, StoreError};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub(crate) const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_keys (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    store_key TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS kv_fields (
    key_id INTEGER NOT NULL REFERENCES kv_keys(id) ON DELETE CASCADE,
    field  TEXT NOT NULL,
    value  TEXT NOT NULL,
    PRIMARY KEY (key_id, field)
);
"#;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Handle to a store file. Clones share one connection.
#[derive(Clone)]
pub struct SqliteKv {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteKv {
    /// Open a file-backed store. Several processes may open the same file.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Create an in-memory store (for testing).
    pub fn memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    /// Create store from existing connection (for multi-connection tests).
    pub fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    fn init_connection(conn: &Connection) -> Result<(), StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // WAL mode for file-backed DBs ("memory" for in-memory)
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(KV_SCHEMA)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Unavailable)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        f(conn)
    }

    pub fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }

    /// Close the underlying connection. Later calls fail with
    /// [`StoreError::Closed`]; closing twice is a no-op.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        match guard.take() {
            Some(conn) => conn.close().map_err(|(_, e)| StoreError::from(e)),
            None => Ok(()),
        }
    }

    /// All fields of `key`, or `None` if the key does not exist.
    pub fn get_fields(&self, key: &str) -> Result<Option<FieldMap>, StoreError> {
        self.with_conn(|conn| Fields(conn).get(key))
    }

    /// Upsert the given fields of `key`, creating the key if needed.
    ///
    /// The key row and its fields commit together; an empty map writes
    /// nothing.
    pub fn set_fields(&self, key: &str, fields: &FieldMap) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        self.immediate(|tx| tx.set(key, fields))
    }

    /// Remove `key` and all its fields. Returns whether the key existed.
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| Fields(conn).delete(key))
    }

    /// One step of a cursor scan over keys matching a SQLite GLOB pattern.
    ///
    /// Start with cursor `0`; a returned cursor of `0` ends the iteration.
    /// Keys created after the scan started may or may not be returned.
    pub fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(Vec<String>, u64), StoreError> {
        let count = count.max(1);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, store_key FROM kv_keys \
                 WHERE id > ?1 AND store_key GLOB ?2 \
                 ORDER BY id LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![cursor as i64, pattern, count as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut keys = Vec::with_capacity(count);
            let mut last_id = 0i64;
            for row in rows {
                let (id, key) = row?;
                last_id = id;
                keys.push(key);
            }

            let next = if keys.len() == count { last_id as u64 } else { 0 };
            Ok((keys, next))
        })
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The write lock is taken up front, so no other connection can
    /// interleave a read-modify-write on the same file. Commits on `Ok`,
    /// rolls back on `Err`.
    pub fn immediate<T>(
        &self,
        f: impl FnOnce(&Fields<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let result = f(&Fields(conn));

            match &result {
                Ok(_) => {
                    if let Err(e) = conn.execute_batch("COMMIT") {
                        let _ = conn.execute_batch("ROLLBACK");
                        return Err(e.into());
                    }
                }
                Err(_) => {
                    let _ = conn.execute_batch("ROLLBACK");
                }
            }

            result
        })
    }
}

/// Field-map operations on a borrowed connection, usable inside
/// [`SqliteKv::immediate`].
pub struct Fields<'c>(&'c Connection);

impl Fields<'_> {
    pub fn get(&self, key: &str) -> Result<Option<FieldMap>, StoreError> {
        let mut stmt = self.0.prepare_cached(
            "SELECT f.field, f.value FROM kv_fields f \
             JOIN kv_keys k ON k.id = f.key_id \
             WHERE k.store_key = ?1",
        )?;
        let rows = stmt.query_map([key], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut fields = FieldMap::new();
        for row in rows {
            let (field, value) = row?;
            fields.insert(field, value);
        }
        Ok((!fields.is_empty()).then_some(fields))
    }

    pub fn set(&self, key: &str, fields: &FieldMap) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        self.0.execute(
            "INSERT INTO kv_keys (store_key) VALUES (?1) ON CONFLICT(store_key) DO NOTHING",
            [key],
        )?;
        let key_id: i64 = self.0.query_row(
            "SELECT id FROM kv_keys WHERE store_key = ?1",
            [key],
            |row| row.get(0),
        )?;

        let mut stmt = self.0.prepare_cached(
            "INSERT INTO kv_fields (key_id, field, value) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key_id, field) DO UPDATE SET value = excluded.value",
        )?;
        for (field, value) in fields {
            stmt.execute(params![key_id, field, value])?;
        }
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed = self
            .0
            .execute("DELETE FROM kv_keys WHERE store_key = ?1", [key])?;
        Ok(removed > 0)
    }
}

/// Escape GLOB metacharacters so `prefix` matches literally.
pub(crate) fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for ch in prefix.chars() {
        match ch {
            '*' | '?' | '[' => {
                out.push('[');
                out.push(ch);
                out.push(']');
            }
            _ => out.push(ch),
        }
    }
    out
}
