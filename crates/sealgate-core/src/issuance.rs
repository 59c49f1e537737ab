//! Issue: validate, seal the canonical request, mint the capability key.

use crate::crypto;
use crate::error::CapabilityError;
use crate::executor::Dispatch;
use crate::schema::{CapabilityToken, IssuanceRequest};
use crate::service::CapabilityService;
use chrono::Utc;

impl<D: Dispatch> CapabilityService<D> {
    /// Issue a capability token for `req`.
    ///
    /// Persists exactly one new capability key on success and nothing on
    /// failure. No backend is contacted.
    pub fn issue(&self, req: &IssuanceRequest) -> Result<CapabilityToken, CapabilityError> {
        self.issue_at(Utc::now().timestamp(), req)
    }

    /// [`issue`](Self::issue) against an explicit clock (unix seconds).
    pub fn issue_at(
        &self,
        now: i64,
        req: &IssuanceRequest,
    ) -> Result<CapabilityToken, CapabilityError> {
        let digest = crate::statement_digest(&req.statement);

        let token = self.issue_inner(now, req).inspect_err(|e| {
            tracing::info!(
                event = "issue.rejected",
                driver = %req.connection.driver_name,
                statement_digest = %digest,
                category = e.category().as_str(),
                error = %e,
            );
        })?;

        tracing::info!(
            event = "issue.issued",
            key_id = %token.key_id,
            driver = %req.connection.driver_name,
            statement_digest = %digest,
            max_uses = req.max_uses,
            expires_at = req.expires_at,
        );
        Ok(token)
    }

    fn issue_inner(
        &self,
        now: i64,
        req: &IssuanceRequest,
    ) -> Result<CapabilityToken, CapabilityError> {
        validate(now, req)?;
        self.dispatcher.check(&req.connection)?;

        let payload = req
            .canonical()
            .to_payload()
            .map_err(|e| CapabilityError::Seal {
                message: e.to_string(),
            })?;
        let pair = crypto::derive_key_pair(&req.secret_material)?;
        let ciphertext = crypto::seal(&payload, pair.public_key())?;

        // validated non-negative above
        let max_uses = req.max_uses as u64;
        let key = self
            .store
            .mint(&req.secret_material, max_uses, req.expires_at)?;

        Ok(CapabilityToken {
            statement: req.statement.clone(),
            declared_param_count: req.declared_param_count,
            key_id: key.key_id,
            ciphertext: Some(ciphertext),
            expires_at: req.expires_at,
        })
    }
}

fn validate(now: i64, req: &IssuanceRequest) -> Result<(), CapabilityError> {
    if req.statement.trim().is_empty() {
        return Err(CapabilityError::invalid("statement is required"));
    }
    if req.connection.driver_name.trim().is_empty() {
        return Err(CapabilityError::invalid("connection.driver is required"));
    }
    if req.max_uses < 0 {
        return Err(CapabilityError::invalid("max_uses must be >= 0"));
    }
    if req.expires_at < 0 {
        return Err(CapabilityError::invalid("expires_at must be >= 0"));
    }
    if req.expires_at != 0 && req.expires_at <= now {
        return Err(CapabilityError::invalid("expires_at must be in the future"));
    }
    if req.secret_material.is_empty() {
        return Err(CapabilityError::invalid("private_key is required"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ConnectionDescriptor;
    use crate::test_support::test_key_pem;
    use crate::{ExecutorDispatcher, KeyStore, ServiceConfig};
    use zeroize::Zeroizing;

    const NOW: i64 = 1_700_000_000;

    fn service() -> CapabilityService<ExecutorDispatcher> {
        CapabilityService::new(
            KeyStore::memory().unwrap(),
            ExecutorDispatcher,
            &ServiceConfig::default(),
        )
    }

    fn request() -> IssuanceRequest {
        IssuanceRequest {
            statement: "SELECT name FROM users WHERE id = $1".into(),
            connection: ConnectionDescriptor::new("postgres")
                .with_param("host", "db")
                .with_param("port", 5432)
                .with_param("user", "u")
                .with_param("pass", "p")
                .with_param("db", "app"),
            declared_param_count: 1,
            expires_at: NOW + 300,
            max_uses: 3,
            secret_material: Zeroizing::new(test_key_pem().into_bytes()),
        }
    }

    fn key_count(svc: &CapabilityService<ExecutorDispatcher>) -> usize {
        svc.store()
            .kv()
            .scan(0, "*", 1000)
            .map(|(keys, _)| keys.len())
            .unwrap()
    }

    #[test]
    fn test_issue_mints_one_key() {
        let svc = service();
        let token = svc.issue_at(NOW, &request()).unwrap();

        assert_eq!(token.statement, "SELECT name FROM users WHERE id = $1");
        assert_eq!(token.declared_param_count, 1);
        assert_eq!(token.expires_at, NOW + 300);
        assert!(token.ciphertext.as_deref().unwrap().starts_with("sg1."));

        let key = svc.store().fetch(&token.key_id).unwrap().unwrap();
        assert_eq!(key.max_uses, 3);
        assert_eq!(key.uses, 0);
        assert_eq!(key.expires_at, NOW + 300);
        assert_eq!(key_count(&svc), 1);
    }

    #[test]
    fn test_structural_failures_persist_nothing() {
        let svc = service();
        let cases: Vec<(&str, Box<dyn Fn(&mut IssuanceRequest)>)> = vec![
            ("empty statement", Box::new(|r| r.statement = "  ".into())),
            ("empty driver", Box::new(|r| r.connection.driver_name.clear())),
            ("negative max_uses", Box::new(|r| r.max_uses = -1)),
            ("negative expiry", Box::new(|r| r.expires_at = -5)),
            ("past expiry", Box::new(|r| r.expires_at = NOW - 1)),
            ("expiry now", Box::new(|r| r.expires_at = NOW)),
            ("empty secret", Box::new(|r| r.secret_material = Zeroizing::new(Vec::new()))),
        ];

        for (name, mutate) in cases {
            let mut req = request();
            mutate(&mut req);
            let err = svc.issue_at(NOW, &req).unwrap_err();
            assert!(
                matches!(err, CapabilityError::InvalidRequest { .. }),
                "{name}: {err:?}"
            );
        }
        assert_eq!(key_count(&svc), 0);
    }

    #[test]
    fn test_unsupported_driver_persists_nothing() {
        let svc = service();
        let mut req = request();
        req.connection.driver_name = "oracle".into();

        let err = svc.issue_at(NOW, &req).unwrap_err();

        assert!(matches!(err, CapabilityError::UnsupportedDriver { .. }));
        assert_eq!(key_count(&svc), 0);
    }

    #[test]
    fn test_bad_connection_params_persist_nothing() {
        let svc = service();
        let mut req = request();
        req.connection.params.remove("db");

        let err = svc.issue_at(NOW, &req).unwrap_err();

        assert!(matches!(err, CapabilityError::InvalidConnectionParams { .. }));
        assert_eq!(key_count(&svc), 0);
    }

    #[test]
    fn test_invalid_key_material_persists_nothing() {
        let svc = service();
        let mut req = request();
        req.secret_material = Zeroizing::new(b"definitely not a key".to_vec());

        let err = svc.issue_at(NOW, &req).unwrap_err();

        assert!(matches!(err, CapabilityError::InvalidKeyMaterial));
        assert_eq!(key_count(&svc), 0);
    }

    #[test]
    fn test_zero_expiry_and_unlimited_uses() {
        let svc = service();
        let mut req = request();
        req.expires_at = 0;
        req.max_uses = 0;

        let token = svc.issue_at(NOW, &req).unwrap();
        let key = svc.store().fetch(&token.key_id).unwrap().unwrap();

        assert_eq!(token.expires_at, 0);
        assert_eq!(key.expires_at, 0);
        assert_eq!(key.max_uses, 0);
    }
}
