//! Wire and sealed data model.
//!
//! Field names follow the HTTP wire format: `driver`, `param_count`,
//! `key_id`, `signature` (the token ciphertext), `params` (runtime values),
//! `private_key` (base64 secret material). An `expires_at` of `0` means the
//! token never expires and is omitted on the wire.

use crate::error::BackendError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use zeroize::Zeroizing;

/// One result row: column name → value.
pub type Row = serde_json::Map<String, Value>;

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// An explicit `null` timestamp reads the same as an absent one.
fn null_as_zero<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    Ok(Option::<i64>::deserialize(deserializer)?.unwrap_or(0))
}

/// Identifies a backend and its connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    #[serde(rename = "driver")]
    pub driver_name: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

impl ConnectionDescriptor {
    pub fn new(driver_name: impl Into<String>) -> Self {
        Self {
            driver_name: driver_name.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// The payload sealed into a token. Immutable once sealed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRequest {
    pub statement: String,
    pub connection: ConnectionDescriptor,
    #[serde(rename = "param_count")]
    pub declared_param_count: usize,
    #[serde(default, deserialize_with = "null_as_zero", skip_serializing_if = "is_zero")]
    pub expires_at: i64,
}

impl CanonicalRequest {
    /// Deterministic serialization: struct fields in declaration order,
    /// connection params in key order.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Issuer input: the canonical request plus usage limits and the secret
/// material the capability key is derived from.
#[derive(Clone, Serialize, Deserialize)]
pub struct IssuanceRequest {
    pub statement: String,
    pub connection: ConnectionDescriptor,
    #[serde(rename = "param_count", default)]
    pub declared_param_count: usize,
    #[serde(default, deserialize_with = "null_as_zero", skip_serializing_if = "is_zero")]
    pub expires_at: i64,
    /// `0` = unlimited. Signed so a negative value is a validation failure
    /// rather than a decode failure.
    #[serde(default)]
    pub max_uses: i64,
    #[serde(rename = "private_key", with = "secret_base64", default)]
    pub secret_material: Zeroizing<Vec<u8>>,
}

impl IssuanceRequest {
    pub fn canonical(&self) -> CanonicalRequest {
        CanonicalRequest {
            statement: self.statement.clone(),
            connection: self.connection.clone(),
            declared_param_count: self.declared_param_count,
            expires_at: self.expires_at,
        }
    }
}

impl fmt::Debug for IssuanceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuanceRequest")
            .field("statement_digest", &crate::statement_digest(&self.statement))
            .field("driver", &self.connection.driver_name)
            .field("declared_param_count", &self.declared_param_count)
            .field("expires_at", &self.expires_at)
            .field("max_uses", &self.max_uses)
            .field("secret_material", &"<redacted>")
            .finish()
    }
}

/// Bearer artifact returned to the issuer and presented at redemption.
///
/// `statement`, `declared_param_count` and `expires_at` travel in the clear
/// for routing and observability; they are advisory and get cross-checked
/// against the sealed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityToken {
    #[serde(default)]
    pub statement: String,
    #[serde(rename = "param_count", default)]
    pub declared_param_count: usize,
    #[serde(default)]
    pub key_id: String,
    #[serde(rename = "signature", default)]
    pub ciphertext: Option<String>,
    #[serde(default, deserialize_with = "null_as_zero", skip_serializing_if = "is_zero")]
    pub expires_at: i64,
}

/// Redeemer input: a token plus fresh runtime parameter values.
///
/// The values are not part of the sealed payload and are not authenticated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedemptionRequest {
    #[serde(flatten)]
    pub token: CapabilityToken,
    #[serde(rename = "params", default)]
    pub param_values: Vec<Value>,
}

impl RedemptionRequest {
    pub fn new(token: CapabilityToken, param_values: Vec<Value>) -> Self {
        Self {
            token,
            param_values,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    ConnectFailure,
    QueryFailure,
    Timeout,
}

/// Backend-level failure reported inside an [`ExecutionResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl From<BackendError> for ExecutionError {
    fn from(err: BackendError) -> Self {
        let kind = match &err {
            BackendError::ConnectFailure(_) => ExecutionErrorKind::ConnectFailure,
            BackendError::QueryFailure(_) => ExecutionErrorKind::QueryFailure,
            BackendError::Timeout(_) => ExecutionErrorKind::Timeout,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

/// Outcome of one backend request/response cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(rename = "results", default)]
    pub rows: Vec<Row>,
    #[serde(default)]
    pub error: Option<ExecutionError>,
}

impl ExecutionResult {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self { rows, error: None }
    }

    pub fn failed(err: BackendError) -> Self {
        Self {
            rows: Vec::new(),
            error: Some(err.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Serde adapter: secret bytes travel as standard base64.
mod secret_base64 {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};
    use zeroize::Zeroizing;

    pub fn serialize<S: Serializer>(
        bytes: &Zeroizing<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes.as_slice()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Zeroizing<Vec<u8>>, D::Error> {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        BASE64
            .decode(encoded.trim())
            .map(Zeroizing::new)
            .map_err(serde::de::Error::custom)
    }
}
