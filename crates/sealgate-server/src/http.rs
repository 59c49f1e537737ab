//! HTTP surface: `/sign`, `/exec`, `/health`.
//!
//! Store and crypto work is synchronous, so issue and authorize run on the
//! blocking pool; only backend dispatch runs on the async executor.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use sealgate_core::{
    CapabilityError, CapabilityService, CapabilityToken, Dispatch, ErrorCategory,
    ExecutionResult, IssuanceRequest, RedemptionRequest, ServiceConfig,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn json_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn rejection(rejection: JsonRejection) -> ApiError {
    json_error(StatusCode::BAD_REQUEST, rejection.body_text())
}

fn task_failed(err: tokio::task::JoinError) -> ApiError {
    tracing::error!(event = "http.task_failed", error = %err);
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal")
}

/// Redemption errors: authorization and lifecycle failures only ever
/// expose their category.
fn exec_error(err: &CapabilityError) -> ApiError {
    let status = match err.category() {
        ErrorCategory::InvalidRequest | ErrorCategory::UnsupportedDriver => {
            StatusCode::BAD_REQUEST
        }
        ErrorCategory::Unauthorized | ErrorCategory::CapabilityUnavailable => {
            StatusCode::FORBIDDEN
        }
        ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_error(status, err.public_message())
}

/// Issuance errors: the issuer owns the input, so detail is kept for
/// everything but subsystem failures.
fn sign_error(err: &CapabilityError) -> ApiError {
    match err.category() {
        ErrorCategory::Internal => json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        _ => json_error(StatusCode::BAD_REQUEST, err.to_string()),
    }
}

/// Build the router. `/sign` is mounted only when signing is enabled.
pub fn router<D: Dispatch>(service: Arc<CapabilityService<D>>, config: &ServiceConfig) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/exec", post(exec::<D>));
    if config.sign_server {
        router = router.route("/sign", post(sign::<D>));
    }

    router
        .with_state(service)
        .layer(cors_layer(config))
        .layer(TraceLayer::new_for_http())
}

pub fn cors_layer(config: &ServiceConfig) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods([
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
    ]);

    if config.allows_any_origin() {
        return layer.allow_origin(Any).allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim()) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(event = "cors.invalid_origin", origin = %origin);
                None
            }
        })
        .collect();

    layer
        .allow_origin(AllowOrigin::list(origins))
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

async fn health() -> &'static str {
    "ok"
}

async fn sign<D: Dispatch>(
    State(service): State<Arc<CapabilityService<D>>>,
    req: Result<Json<IssuanceRequest>, JsonRejection>,
) -> Result<Json<CapabilityToken>, ApiError> {
    let Json(req) = req.map_err(rejection)?;

    let token = tokio::task::spawn_blocking(move || service.issue(&req))
        .await
        .map_err(task_failed)?
        .map_err(|e| sign_error(&e))?;
    Ok(Json(token))
}

async fn exec<D: Dispatch>(
    State(service): State<Arc<CapabilityService<D>>>,
    req: Result<Json<RedemptionRequest>, JsonRejection>,
) -> Result<Json<ExecutionResult>, ApiError> {
    let Json(req) = req.map_err(rejection)?;

    let authorized = {
        let service = Arc::clone(&service);
        tokio::task::spawn_blocking(move || service.authorize(&req))
            .await
            .map_err(task_failed)?
            .map_err(|e| exec_error(&e))?
    };

    let result = service
        .dispatch(&authorized)
        .await
        .map_err(|e| exec_error(&e))?;
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_error_statuses() {
        let cases = [
            (CapabilityError::TamperedOrInvalidToken, StatusCode::FORBIDDEN, "unauthorized"),
            (
                CapabilityError::PayloadMismatch { field: "statement" },
                StatusCode::FORBIDDEN,
                "unauthorized",
            ),
            (CapabilityError::UsesExceeded, StatusCode::FORBIDDEN, "capability_unavailable"),
            (CapabilityError::UnknownKey, StatusCode::FORBIDDEN, "capability_unavailable"),
            (
                CapabilityError::Store(sealgate_core::StoreError::Unavailable),
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
            ),
        ];
        for (err, status, message) in cases {
            let (got, Json(body)) = exec_error(&err);
            assert_eq!(got, status, "{err:?}");
            assert_eq!(body.error, message);
        }
    }

    #[test]
    fn test_sign_error_keeps_input_detail() {
        let (status, Json(body)) = sign_error(&CapabilityError::InvalidKeyMaterial);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error, "invalid key material");

        let (status, Json(body)) = sign_error(&CapabilityError::UnsupportedDriver {
            driver: "oracle".into(),
        });
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.error.contains("oracle"));
    }
}
