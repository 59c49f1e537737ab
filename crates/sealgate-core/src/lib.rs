//! Capability tokens for pre-authorized backend statements.
//!
//! An issuer seals a parameterized SQL/CQL statement together with its
//! target connection into an encrypted, limited-use, time-bounded
//! capability token. A less-trusted caller later redeems the token,
//! supplying only the runtime parameter values.
//!
//! ## Architecture
//!
//! ```text
//! issue:   Issuance ──▶ crypto::seal ──▶ KeyStore::mint ──▶ CapabilityToken
//!
//! redeem:  Redemption ──▶ KeyStore::fetch ──▶ crypto::open ──▶ cross-check
//!                    ──▶ KeyStore::consume_use ──▶ Dispatch ──▶ backend
//! ```
//!
//! The [`KeyStore`] is the only contended shared resource. It lives in a
//! SQLite file on one host or on a Redis server shared across hosts. Use
//! accounting is one atomic step on either backend, so concurrent
//! redemptions of a `max_uses = 1` token cannot both succeed.
//!
//! # Quick Start
//!
//! ```no_run
//! use sealgate_core::{CapabilityService, ExecutorDispatcher, KeyStore, ServiceConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = KeyStore::memory()?;
//! let service = CapabilityService::new(store, ExecutorDispatcher, &ServiceConfig::default());
//! # let _ = service;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod executor;
mod issuance;
mod redemption;
pub mod schema;
pub mod service;
pub mod store;
pub mod sweeper;
#[cfg(test)]
mod test_support;

pub use config::ServiceConfig;
pub use context::ServiceContext;
pub use error::{BackendError, CapabilityError, ErrorCategory};
pub use executor::{Dispatch, DriverName, ExecutorDispatcher};
pub use schema::{
    CanonicalRequest, CapabilityToken, ConnectionDescriptor, ExecutionError, ExecutionResult,
    IssuanceRequest, RedemptionRequest, Row,
};
pub use redemption::Authorized;
pub use service::CapabilityService;
pub use store::{CapabilityKey, ConsumeOutcome, KeyStore, StoreError, SweepReport};
pub use sweeper::Sweeper;

/// Short, log-safe fingerprint of a statement.
///
/// Statement text never reaches the logs; this digest lets operators
/// correlate issuance and redemption of the same statement.
pub fn statement_digest(statement: &str) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(statement.as_bytes());
    hex::encode(&hash[..8])
}
