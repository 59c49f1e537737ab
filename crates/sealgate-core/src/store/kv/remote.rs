//! Redis backend.
//!
//! Records are Redis hashes. Use accounting runs as one Lua script, which
//! Redis executes without interleaving any other command, so the count is
//! exact across every instance sharing the server.

use super::{FieldMap, StoreError};
use crate::store::ConsumeOutcome;
use redis::{Client, Connection, ErrorKind, IntoConnectionInfo, RedisError, Script};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const IO_TIMEOUT: Duration = Duration::from_secs(30);

const CONSUMED_MISSING: i64 = -1;
const CONSUMED_EXHAUSTED: i64 = -2;

/// KEYS[1] = record, ARGV[1] = uses field, ARGV[2] = max_uses field.
/// Returns the new use count, -1 for a missing record, -2 once the record
/// was exhausted and deleted.
const CONSUME_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return -1
end
local uses = tonumber(redis.call('HGET', KEYS[1], ARGV[1]))
local max = tonumber(redis.call('HGET', KEYS[1], ARGV[2]))
if uses == nil or max == nil then
  return redis.error_reply('CORRUPT unparseable use counters')
end
uses = uses + 1
if max > 0 and uses > max then
  redis.call('DEL', KEYS[1])
  return -2
end
redis.call('HSET', KEYS[1], ARGV[1], tostring(uses))
return uses
";

fn consume_script() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(CONSUME_SCRIPT))
}

struct Session {
    client: Client,
    conn: Option<Connection>,
}

/// Handle to a Redis server. Clones share one connection, which is
/// re-established on the next call after a connection-level failure.
#[derive(Clone)]
pub struct RedisKv {
    session: Arc<Mutex<Option<Session>>>,
}

impl RedisKv {
    /// Connect and authenticate. Fails with [`StoreError::Unavailable`]
    /// when the server cannot be reached.
    pub fn connect(host: &str, port: u16, password: Option<&str>) -> Result<Self, StoreError> {
        let mut info = (host.to_string(), port)
            .into_connection_info()
            .map_err(store_error)?;
        info.redis.password = password.map(str::to_string);
        let client = Client::open(info).map_err(store_error)?;
        let conn = open(&client).map_err(store_error)?;

        Ok(Self {
            session: Arc::new(Mutex::new(Some(Session {
                client,
                conn: Some(conn),
            }))),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Session>>, StoreError> {
        self.session.lock().map_err(|_| StoreError::Unavailable)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, RedisError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.lock()?;
        let session = guard.as_mut().ok_or(StoreError::Closed)?;
        let mut conn = match session.conn.take() {
            Some(conn) => conn,
            None => open(&session.client).map_err(store_error)?,
        };

        let result = f(&mut conn);
        match &result {
            Err(e) if is_connection_error(e) => {
                tracing::warn!(event = "store.connection_lost", error = %e);
            }
            _ => session.conn = Some(conn),
        }
        result.map_err(store_error)
    }

    pub fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| redis::cmd("PING").query::<String>(conn).map(drop))
    }

    /// Drop the connection. Later calls fail with [`StoreError::Closed`];
    /// closing twice is a no-op.
    pub fn close(&self) -> Result<(), StoreError> {
        self.lock()?.take();
        Ok(())
    }

    pub fn get_fields(&self, key: &str) -> Result<Option<FieldMap>, StoreError> {
        let fields: FieldMap = self.with_conn(|conn| redis::cmd("HGETALL").arg(key).query(conn))?;
        Ok((!fields.is_empty()).then_some(fields))
    }

    /// One HSET, so the fields land together.
    pub fn set_fields(&self, key: &str, fields: &FieldMap) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        self.with_conn(|conn| cmd.query::<i64>(conn).map(drop))
    }

    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed: i64 = self.with_conn(|conn| redis::cmd("DEL").arg(key).query(conn))?;
        Ok(removed > 0)
    }

    /// `SCAN cursor MATCH pattern COUNT count`. `count` is a hint, so a
    /// step may return more or fewer keys; a returned cursor of `0` ends
    /// the iteration.
    pub fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(Vec<String>, u64), StoreError> {
        let (next, keys): (u64, Vec<String>) = self.with_conn(|conn| {
            redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count.max(1))
                .query(conn)
        })?;
        Ok((keys, next))
    }

    /// Charge one use of `record` atomically on the server.
    pub(crate) fn consume(
        &self,
        record: &str,
        uses_field: &str,
        max_uses_field: &str,
    ) -> Result<ConsumeOutcome, StoreError> {
        let code: i64 = self
            .with_conn(|conn| {
                consume_script()
                    .key(record)
                    .arg(uses_field)
                    .arg(max_uses_field)
                    .invoke(conn)
            })
            .map_err(|e| match e {
                StoreError::Corrupt { reason, .. } => StoreError::Corrupt {
                    key: record.to_string(),
                    reason,
                },
                other => other,
            })?;
        Ok(consume_outcome(code))
    }
}

fn open(client: &Client) -> Result<Connection, RedisError> {
    let conn = client.get_connection_with_timeout(CONNECT_TIMEOUT)?;
    conn.set_read_timeout(Some(IO_TIMEOUT))?;
    conn.set_write_timeout(Some(IO_TIMEOUT))?;
    Ok(conn)
}

fn is_connection_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
}

fn store_error(e: RedisError) -> StoreError {
    if is_connection_error(&e) {
        tracing::debug!(event = "store.unreachable", error = %e);
        return StoreError::Unavailable;
    }
    match (e.kind(), e.code()) {
        (ErrorKind::AuthenticationFailed, _) => StoreError::Unavailable,
        // raised by the consume script
        (_, Some("CORRUPT")) => StoreError::Corrupt {
            key: String::new(),
            reason: e.detail().unwrap_or("corrupt record").to_string(),
        },
        _ => StoreError::Database(e.to_string()),
    }
}

fn consume_outcome(code: i64) -> ConsumeOutcome {
    match code {
        CONSUMED_MISSING => ConsumeOutcome::NotFound,
        CONSUMED_EXHAUSTED => ConsumeOutcome::Exhausted,
        uses => ConsumeOutcome::Consumed {
            uses: u64::try_from(uses).unwrap_or(0),
        },
    }
}

/// Escape Redis glob metacharacters so `prefix` matches literally.
pub(crate) fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_server_is_unavailable() {
        // Port 1 on loopback refuses immediately.
        let result = RedisKv::connect("127.0.0.1", 1, None);
        assert!(matches!(result, Err(StoreError::Unavailable)));
    }

    #[test]
    fn test_consume_outcome_codes() {
        assert_eq!(consume_outcome(-1), ConsumeOutcome::NotFound);
        assert_eq!(consume_outcome(-2), ConsumeOutcome::Exhausted);
        assert_eq!(consume_outcome(1), ConsumeOutcome::Consumed { uses: 1 });
        assert_eq!(consume_outcome(42), ConsumeOutcome::Consumed { uses: 42 });
    }

    #[test]
    fn test_consume_script_codes_match() {
        assert!(CONSUME_SCRIPT.contains(&format!("return {CONSUMED_MISSING}")));
        assert!(CONSUME_SCRIPT.contains(&format!("return {CONSUMED_EXHAUSTED}")));
        // the delete happens in the same script as the increment
        let del = CONSUME_SCRIPT.find("'DEL'").unwrap();
        let set = CONSUME_SCRIPT.find("'HSET'").unwrap();
        assert!(del < set);
    }

    #[test]
    fn test_glob_escape_is_literal() {
        assert_eq!(glob_escape("keys:"), "keys:");
        assert_eq!(glob_escape("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\");
    }
}
