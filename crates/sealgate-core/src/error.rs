//! Error taxonomy for issuance, redemption and dispatch.

use crate::crypto::CryptoError;
use crate::store::StoreError;
use std::time::Duration;

/// Coarse category that crosses the service boundary.
///
/// Callers never learn which specific authorization or lifecycle check
/// failed; only the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed input.
    InvalidRequest,
    /// Token failed an authenticity or binding check.
    Unauthorized,
    /// Capability key missing, expired or used up. Terminal for the token.
    CapabilityUnavailable,
    /// Driver name outside the registered set.
    UnsupportedDriver,
    /// Store or crypto subsystem failure.
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::Unauthorized => "unauthorized",
            Self::CapabilityUnavailable => "capability_unavailable",
            Self::UnsupportedDriver => "unsupported_driver",
            Self::Internal => "internal",
        }
    }
}

/// Issuance and redemption errors.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("invalid connection params for {driver}: {reason}")]
    InvalidConnectionParams { driver: String, reason: String },

    #[error("invalid key material")]
    InvalidKeyMaterial,

    #[error("token ciphertext could not be opened")]
    TamperedOrInvalidToken,

    #[error("token field '{field}' does not match sealed payload")]
    PayloadMismatch { field: &'static str },

    #[error("expected {declared} params, got {supplied}")]
    ParamCountMismatch { declared: usize, supplied: usize },

    #[error("unknown capability key")]
    UnknownKey,

    #[error("capability expired")]
    Expired,

    #[error("capability uses exceeded")]
    UsesExceeded,

    #[error("unsupported driver: {driver}")]
    UnsupportedDriver { driver: String },

    #[error("sealing failed: {message}")]
    Seal { message: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl CapabilityError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidRequest { .. } | Self::InvalidConnectionParams { .. } => {
                ErrorCategory::InvalidRequest
            }
            Self::InvalidKeyMaterial
            | Self::TamperedOrInvalidToken
            | Self::PayloadMismatch { .. }
            | Self::ParamCountMismatch { .. } => ErrorCategory::Unauthorized,
            Self::UnknownKey | Self::Expired | Self::UsesExceeded => {
                ErrorCategory::CapabilityUnavailable
            }
            Self::UnsupportedDriver { .. } => ErrorCategory::UnsupportedDriver,
            Self::Seal { .. } | Self::Store(_) => ErrorCategory::Internal,
        }
    }

    /// Text safe to return to an untrusted caller.
    ///
    /// Input errors keep their detail (the caller already knows the input);
    /// authorization and lifecycle failures collapse to their category.
    pub fn public_message(&self) -> String {
        match self.category() {
            ErrorCategory::InvalidRequest | ErrorCategory::UnsupportedDriver => self.to_string(),
            other => other.as_str().to_string(),
        }
    }

    /// Only store/crypto subsystem failures are worth retrying; everything
    /// else is terminal for this token or this input.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Internal
    }
}

impl From<CryptoError> for CapabilityError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidKeyMaterial => Self::InvalidKeyMaterial,
            CryptoError::DecryptFailure => Self::TamperedOrInvalidToken,
            CryptoError::SealFailure { message } => Self::Seal { message },
        }
    }
}

/// Backend failures. Returned inside the execution result, never thrown to
/// the redeemer. Never retried inside the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("connect failed: {0}")]
    ConnectFailure(String),

    #[error("query failed: {0}")]
    QueryFailure(String),

    #[error("execution exceeded {0:?}")]
    Timeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_message_hides_authorization_detail() {
        let mismatch = CapabilityError::PayloadMismatch { field: "statement" };
        let tampered = CapabilityError::TamperedOrInvalidToken;
        assert_eq!(mismatch.public_message(), tampered.public_message());
        assert_eq!(mismatch.public_message(), "unauthorized");
    }

    #[test]
    fn test_public_message_hides_lifecycle_detail() {
        for err in [
            CapabilityError::UnknownKey,
            CapabilityError::Expired,
            CapabilityError::UsesExceeded,
        ] {
            assert_eq!(err.public_message(), "capability_unavailable");
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_input_errors_keep_detail() {
        let err = CapabilityError::invalid("statement is required");
        assert_eq!(err.category(), ErrorCategory::InvalidRequest);
        assert!(err.public_message().contains("statement is required"));

        let err = CapabilityError::UnsupportedDriver {
            driver: "oracle".into(),
        };
        assert!(err.public_message().contains("oracle"));
    }

    #[test]
    fn test_store_errors_are_retryable() {
        let err = CapabilityError::from(StoreError::Unavailable);
        assert_eq!(err.category(), ErrorCategory::Internal);
        assert!(err.is_retryable());
        assert_eq!(err.public_message(), "internal");
    }

    #[test]
    fn test_crypto_errors_map_into_taxonomy() {
        assert!(matches!(
            CapabilityError::from(CryptoError::DecryptFailure),
            CapabilityError::TamperedOrInvalidToken
        ));
        assert!(matches!(
            CapabilityError::from(CryptoError::InvalidKeyMaterial),
            CapabilityError::InvalidKeyMaterial
        ));
    }
}
