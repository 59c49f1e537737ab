//! KeyStore: persisted capability keys with use accounting.
//!
//! Each key is one field-map record under `<prefix><key_id>` with the
//! string fields `key_id`, `key_bytes` (standard base64), `expires_at`,
//! `max_uses` and `uses`. Provides:
//! - Mint / fetch / delete
//! - Atomic use consumption (one immediate transaction on SQLite, one
//!   server-side script on Redis)
//! - Cursor-based expiry sweep

mod kv;

pub use kv::{FieldMap, Fields, KvStore, RedisKv, SqliteKv};

use crate::config::{ServiceConfig, StoreLocation};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Default namespace for capability records.
pub const DEFAULT_PREFIX: &str = "keys:";

/// Default number of keys loaded per scan step.
pub const DEFAULT_SWEEP_BATCH: usize = 100;

const FIELD_KEY_ID: &str = "key_id";
const FIELD_KEY_BYTES: &str = "key_bytes";
const FIELD_EXPIRES_AT: &str = "expires_at";
const FIELD_MAX_USES: &str = "max_uses";
const FIELD_USES: &str = "uses";

/// Store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable")]
    Unavailable,

    #[error("store closed")]
    Closed,

    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Persisted capability secret plus accounting.
#[derive(Clone, PartialEq, Eq)]
pub struct CapabilityKey {
    pub key_id: String,
    pub secret_material: Zeroizing<Vec<u8>>,
    /// Unix seconds; `0` = never.
    pub expires_at: i64,
    /// `0` = unlimited.
    pub max_uses: u64,
    pub uses: u64,
}

impl CapabilityKey {
    /// Expired strictly after `expires_at`.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at != 0 && now > self.expires_at
    }

    fn to_fields(&self) -> FieldMap {
        FieldMap::from([
            (FIELD_KEY_ID.to_string(), self.key_id.clone()),
            (
                FIELD_KEY_BYTES.to_string(),
                BASE64.encode(self.secret_material.as_slice()),
            ),
            (FIELD_EXPIRES_AT.to_string(), self.expires_at.to_string()),
            (FIELD_MAX_USES.to_string(), self.max_uses.to_string()),
            (FIELD_USES.to_string(), self.uses.to_string()),
        ])
    }

    fn from_fields(record: &str, fields: &FieldMap) -> Result<Self, StoreError> {
        let secret_material = BASE64
            .decode(required_field(record, fields, FIELD_KEY_BYTES)?)
            .map_err(|_| corrupt(record, FIELD_KEY_BYTES))?;

        Ok(Self {
            key_id: required_field(record, fields, FIELD_KEY_ID)?.to_string(),
            secret_material: Zeroizing::new(secret_material),
            expires_at: parse_field(record, fields, FIELD_EXPIRES_AT)?,
            max_uses: parse_field(record, fields, FIELD_MAX_USES)?,
            uses: parse_field(record, fields, FIELD_USES)?,
        })
    }
}

impl fmt::Debug for CapabilityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityKey")
            .field("key_id", &self.key_id)
            .field("secret_material", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("max_uses", &self.max_uses)
            .field("uses", &self.uses)
            .finish()
    }
}

fn corrupt(record: &str, field: &str) -> StoreError {
    StoreError::Corrupt {
        key: record.to_string(),
        reason: format!("unparseable field {field}"),
    }
}

fn required_field<'a>(
    record: &str,
    fields: &'a FieldMap,
    name: &str,
) -> Result<&'a str, StoreError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| StoreError::Corrupt {
            key: record.to_string(),
            reason: format!("missing field {name}"),
        })
}

fn parse_field<T: FromStr>(
    record: &str,
    fields: &FieldMap,
    name: &str,
) -> Result<T, StoreError> {
    required_field(record, fields, name)?
        .parse()
        .map_err(|_| corrupt(record, name))
}

/// Result of [`KeyStore::consume_use`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// One use charged; `uses` is the post-increment count.
    Consumed { uses: u64 },
    NotFound,
    /// The increment went past `max_uses`; the key has been deleted.
    Exhausted,
}

/// Counters for one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
    /// Records that could not be loaded or deleted; skipped, not fatal.
    pub failed: usize,
}

/// Capability key store over either [`KvStore`] backend.
#[derive(Clone)]
pub struct KeyStore {
    kv: KvStore,
    prefix: String,
}

impl KeyStore {
    /// Open the backend `config` selects, under its prefix.
    pub fn from_config(config: &ServiceConfig) -> Result<Self, StoreError> {
        let kv = match config.store_location() {
            StoreLocation::File(path) => KvStore::open(path)?,
            StoreLocation::Remote {
                host,
                port,
                password,
            } => KvStore::connect(host, port, password)?,
        };
        Ok(Self::from_kv(kv).with_prefix(config.store_prefix.clone()))
    }

    /// Open a file-backed store.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::from_kv(KvStore::open(path)?))
    }

    /// Create an in-memory store (for testing).
    pub fn memory() -> Result<Self, StoreError> {
        Ok(Self::from_kv(KvStore::memory()?))
    }

    pub fn from_kv(kv: KvStore) -> Self {
        Self {
            kv,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub fn ping(&self) -> Result<(), StoreError> {
        self.kv.ping()
    }

    pub fn close(&self) -> Result<(), StoreError> {
        self.kv.close()
    }

    fn record_key(&self, key_id: &str) -> String {
        format!("{}{}", self.prefix, key_id)
    }

    /// Persist a fresh key with `uses = 0` under a new UUID.
    pub fn mint(
        &self,
        secret_material: &[u8],
        max_uses: u64,
        expires_at: i64,
    ) -> Result<CapabilityKey, StoreError> {
        let key = CapabilityKey {
            key_id: Uuid::new_v4().to_string(),
            secret_material: Zeroizing::new(secret_material.to_vec()),
            expires_at,
            max_uses,
            uses: 0,
        };
        self.kv
            .set_fields(&self.record_key(&key.key_id), &key.to_fields())?;

        tracing::debug!(
            event = "capability_key.minted",
            key_id = %key.key_id,
            max_uses = key.max_uses,
            expires_at = key.expires_at,
        );
        Ok(key)
    }

    /// Load a key. Absence (including after deletion) is `Ok(None)`.
    pub fn fetch(&self, key_id: &str) -> Result<Option<CapabilityKey>, StoreError> {
        let record = self.record_key(key_id);
        match self.kv.get_fields(&record)? {
            Some(fields) => CapabilityKey::from_fields(&record, &fields).map(Some),
            None => Ok(None),
        }
    }

    /// Charge one use.
    ///
    /// The read, increment, compare and write/delete form one atomic step:
    /// a `BEGIN IMMEDIATE` transaction on SQLite, a Lua script on Redis.
    /// Concurrent callers on any connection observe a strict sequence.
    pub fn consume_use(&self, key_id: &str) -> Result<ConsumeOutcome, StoreError> {
        let record = self.record_key(key_id);
        let outcome = match &self.kv {
            KvStore::Sqlite(db) => Self::consume_in_txn(db, &record)?,
            KvStore::Redis(db) => db.consume(&record, FIELD_USES, FIELD_MAX_USES)?,
        };

        match outcome {
            ConsumeOutcome::Consumed { uses } => {
                tracing::debug!(event = "capability_key.consumed", key_id = %key_id, uses);
            }
            ConsumeOutcome::Exhausted => {
                tracing::info!(event = "capability_key.exhausted", key_id = %key_id);
            }
            ConsumeOutcome::NotFound => {}
        }
        Ok(outcome)
    }

    fn consume_in_txn(db: &SqliteKv, record: &str) -> Result<ConsumeOutcome, StoreError> {
        db.immediate(|tx| {
            let Some(fields) = tx.get(record)? else {
                return Ok(ConsumeOutcome::NotFound);
            };
            let key = CapabilityKey::from_fields(record, &fields)?;
            let uses = key.uses.saturating_add(1);

            if key.max_uses > 0 && uses > key.max_uses {
                tx.delete(record)?;
                return Ok(ConsumeOutcome::Exhausted);
            }

            tx.set(
                record,
                &FieldMap::from([(FIELD_USES.to_string(), uses.to_string())]),
            )?;
            Ok(ConsumeOutcome::Consumed { uses })
        })
    }

    /// Remove a key. Deleting a missing key is a no-op.
    pub fn delete(&self, key_id: &str) -> Result<bool, StoreError> {
        self.kv.delete(&self.record_key(key_id))
    }

    pub fn sweep_expired(&self, batch_size: usize) -> Result<SweepReport, StoreError> {
        self.sweep_expired_at(Utc::now().timestamp(), batch_size)
    }

    /// One full scan over the namespace, deleting keys past `expires_at`.
    ///
    /// Errors on individual records are logged and counted; only a failing
    /// scan step aborts the pass.
    pub fn sweep_expired_at(
        &self,
        now: i64,
        batch_size: usize,
    ) -> Result<SweepReport, StoreError> {
        let pattern = self.kv.prefix_pattern(&self.prefix);
        let mut report = SweepReport::default();
        let mut cursor = 0;

        loop {
            let (records, next) = self.kv.scan(cursor, &pattern, batch_size)?;
            for record in records {
                report.scanned += 1;
                match self.sweep_one(&record, now) {
                    Ok(true) => report.removed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        report.failed += 1;
                        tracing::warn!(
                            event = "sweep.record_failed",
                            record = %record,
                            error = %e,
                        );
                    }
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(report)
    }

    fn sweep_one(&self, record: &str, now: i64) -> Result<bool, StoreError> {
        let Some(fields) = self.kv.get_fields(record)? else {
            return Ok(false);
        };
        let expires_at: i64 = parse_field(record, &fields, FIELD_EXPIRES_AT)?;
        if expires_at != 0 && now > expires_at {
            return self.kv.delete(record);
        }
        Ok(false)
    }
}
