//! Fixtures shared by the sealgate-core integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use sealgate_core::{
    CapabilityError, CapabilityService, CapabilityToken, ConnectionDescriptor, Dispatch,
    DriverName, ExecutionResult, IssuanceRequest, KeyStore, RedemptionRequest, Row,
    ServiceConfig,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use zeroize::Zeroizing;

pub const STATEMENT: &str = "SELECT balance FROM accounts WHERE id = $1 AND region = $2";

static KEY_PEM: OnceLock<String> = OnceLock::new();

/// One RSA key per test binary.
pub fn key_pem() -> &'static str {
    KEY_PEM.get_or_init(|| {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("keygen");
        key.to_pkcs8_pem(LineEnding::LF).expect("pem").to_string()
    })
}

#[derive(Debug, Clone)]
pub struct Call {
    pub driver: String,
    pub statement: String,
    pub params: Vec<Value>,
}

/// Dispatch double: accepts the registered driver names, records every
/// execution and echoes the params back as one row.
#[derive(Clone, Default)]
pub struct RecordingDispatch {
    calls: Arc<Mutex<Vec<Call>>>,
    delay: Option<Duration>,
}

impl RecordingDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dispatch for RecordingDispatch {
    fn check(&self, connection: &ConnectionDescriptor) -> Result<(), CapabilityError> {
        DriverName::resolve(&connection.driver_name).map(|_| ())
    }

    async fn execute(
        &self,
        connection: &ConnectionDescriptor,
        statement: &str,
        params: &[Value],
    ) -> Result<ExecutionResult, CapabilityError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().unwrap().push(Call {
            driver: connection.driver_name.clone(),
            statement: statement.to_string(),
            params: params.to_vec(),
        });
        let mut row = Row::new();
        row.insert("echo".into(), Value::Array(params.to_vec()));
        Ok(ExecutionResult::from_rows(vec![row]))
    }
}

pub fn service(store: KeyStore, dispatch: RecordingDispatch) -> CapabilityService<RecordingDispatch> {
    CapabilityService::new(store, dispatch, &ServiceConfig::default())
}

pub fn connection() -> ConnectionDescriptor {
    ConnectionDescriptor::new("postgres")
        .with_param("host", "db.internal")
        .with_param("port", 5432)
        .with_param("user", "reporting")
        .with_param("pass", "s3cret")
        .with_param("db", "ledger")
}

pub fn issuance(max_uses: i64, expires_at: i64) -> IssuanceRequest {
    IssuanceRequest {
        statement: STATEMENT.into(),
        connection: connection(),
        declared_param_count: 2,
        expires_at,
        max_uses,
        secret_material: Zeroizing::new(key_pem().as_bytes().to_vec()),
    }
}

pub fn redemption(token: &CapabilityToken) -> RedemptionRequest {
    RedemptionRequest::new(token.clone(), vec![json!(42), json!("eu")])
}

pub fn uses<D: Dispatch>(svc: &CapabilityService<D>, token: &CapabilityToken) -> Option<u64> {
    svc.store().fetch(&token.key_id).unwrap().map(|k| k.uses)
}
