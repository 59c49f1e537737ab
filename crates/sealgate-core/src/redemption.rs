//! Redeem: authorize a token, charge one use, dispatch the statement.
//!
//! Authorization is synchronous (store + crypto) and split from the async
//! dispatch so callers can run it off the async executor.
//!
//! The runtime parameter values are not part of the sealed payload. Only
//! their count is bound; any values of the declared arity are executed.

use crate::crypto;
use crate::error::{BackendError, CapabilityError};
use crate::executor::Dispatch;
use crate::schema::{CanonicalRequest, ExecutionResult, RedemptionRequest};
use crate::service::CapabilityService;
use crate::store::ConsumeOutcome;
use chrono::Utc;
use serde_json::Value;

/// A token that passed every check and has been charged one use.
#[derive(Debug, Clone)]
pub struct Authorized {
    pub key_id: String,
    /// Post-increment use count.
    pub uses: u64,
    /// The opened, cross-checked payload.
    pub request: CanonicalRequest,
    pub param_values: Vec<Value>,
}

impl<D: Dispatch> CapabilityService<D> {
    /// Authorize and execute one redemption.
    pub async fn redeem(&self, req: &RedemptionRequest) -> Result<ExecutionResult, CapabilityError> {
        self.redeem_at(Utc::now().timestamp(), req).await
    }

    /// [`redeem`](Self::redeem) against an explicit clock (unix seconds).
    pub async fn redeem_at(
        &self,
        now: i64,
        req: &RedemptionRequest,
    ) -> Result<ExecutionResult, CapabilityError> {
        let authorized = self.authorize_at(now, req)?;
        self.dispatch(&authorized).await
    }

    pub fn authorize(&self, req: &RedemptionRequest) -> Result<Authorized, CapabilityError> {
        self.authorize_at(Utc::now().timestamp(), req)
    }

    /// Every check up to and including the use charge.
    ///
    /// The specific failure is logged at debug level only; callers should
    /// surface [`CapabilityError::public_message`].
    pub fn authorize_at(
        &self,
        now: i64,
        req: &RedemptionRequest,
    ) -> Result<Authorized, CapabilityError> {
        let authorized = self.authorize_inner(now, req).inspect_err(|e| {
            tracing::debug!(
                event = "redeem.rejected",
                key_id = %req.token.key_id,
                category = e.category().as_str(),
                error = %e,
            );
        })?;

        tracing::info!(
            event = "redeem.authorized",
            key_id = %authorized.key_id,
            driver = %authorized.request.connection.driver_name,
            statement_digest = %crate::statement_digest(&authorized.request.statement),
            uses = authorized.uses,
        );
        Ok(authorized)
    }

    fn authorize_inner(
        &self,
        now: i64,
        req: &RedemptionRequest,
    ) -> Result<Authorized, CapabilityError> {
        let token = &req.token;
        let ciphertext = check_shape(now, req)?;

        let key = self
            .store
            .fetch(&token.key_id)?
            .ok_or(CapabilityError::UnknownKey)?;
        if key.is_expired_at(now) {
            return Err(CapabilityError::Expired);
        }

        let pair = crypto::derive_key_pair(&key.secret_material)?;
        let payload = crypto::open(ciphertext, pair.private_key())?;
        let sealed = CanonicalRequest::from_payload(&payload)
            .map_err(|_| CapabilityError::TamperedOrInvalidToken)?;

        if sealed.statement != token.statement {
            return Err(CapabilityError::PayloadMismatch { field: "statement" });
        }
        if sealed.declared_param_count != token.declared_param_count {
            return Err(CapabilityError::PayloadMismatch {
                field: "param_count",
            });
        }
        if sealed.expires_at != token.expires_at {
            return Err(CapabilityError::PayloadMismatch {
                field: "expires_at",
            });
        }
        if sealed.expires_at != 0 && now > sealed.expires_at {
            return Err(CapabilityError::Expired);
        }

        // an unrunnable statement must not cost a use
        self.dispatcher.check(&sealed.connection)?;

        let uses = match self.store.consume_use(&token.key_id)? {
            ConsumeOutcome::Consumed { uses } => uses,
            ConsumeOutcome::NotFound => return Err(CapabilityError::UnknownKey),
            ConsumeOutcome::Exhausted => return Err(CapabilityError::UsesExceeded),
        };

        Ok(Authorized {
            key_id: token.key_id.clone(),
            uses,
            request: sealed,
            param_values: req.param_values.clone(),
        })
    }

    /// Run an authorized statement under the execution deadline.
    ///
    /// Backend failures, including the deadline, come back inside the
    /// result; the use stays charged.
    pub async fn dispatch(&self, authorized: &Authorized) -> Result<ExecutionResult, CapabilityError> {
        let request = &authorized.request;
        let run = self.dispatcher.execute(
            &request.connection,
            &request.statement,
            &authorized.param_values,
        );

        match tokio::time::timeout(self.exec_timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    event = "redeem.timeout",
                    key_id = %authorized.key_id,
                    driver = %request.connection.driver_name,
                    timeout_ms = self.exec_timeout.as_millis() as u64,
                );
                Ok(ExecutionResult::failed(BackendError::Timeout(
                    self.exec_timeout,
                )))
            }
        }
    }
}

/// Token shape. Fails closed without touching the store or crypto.
fn check_shape(now: i64, req: &RedemptionRequest) -> Result<&str, CapabilityError> {
    let token = &req.token;
    if token.statement.trim().is_empty() {
        return Err(CapabilityError::invalid("statement is required"));
    }
    if token.key_id.trim().is_empty() {
        return Err(CapabilityError::invalid("key_id is required"));
    }
    let ciphertext = match token.ciphertext.as_deref() {
        Some(c) if !c.is_empty() => c,
        _ => return Err(CapabilityError::invalid("signature is required")),
    };
    if token.expires_at < 0 {
        return Err(CapabilityError::invalid("expires_at must be >= 0"));
    }
    if token.expires_at != 0 && now > token.expires_at {
        return Err(CapabilityError::Expired);
    }
    if req.param_values.len() != token.declared_param_count {
        return Err(CapabilityError::ParamCountMismatch {
            declared: token.declared_param_count,
            supplied: req.param_values.len(),
        });
    }
    Ok(ciphertext)
}
