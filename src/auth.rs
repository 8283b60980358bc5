//! # Authentication and Authorization
//!
//! Operator bearer authentication and tenant header validation for the
//! `/api/v1` routes. Webhook intake is authenticated by signature instead and
//! does not pass through this layer.

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts, Request, State},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{ApiError, unauthorized, validation_error};
use crate::server::AppState;
use crate::telemetry::TraceContext;

pub const TENANT_HEADER: &str = "X-Tenant-Id";

/// Tenant ID wrapper for type safety
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TenantId(pub Uuid);

/// Marker type for authenticated operator requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorAuth;

/// Extractor for tenant ID from request extensions
#[derive(Debug, Clone, Copy)]
pub struct TenantExtension(pub TenantId);

impl TenantExtension {
    pub fn id(&self) -> Uuid {
        self.0.0
    }
}

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(app_state: &AppState) -> Self {
        Arc::clone(&app_state.config)
    }
}

/// Authentication middleware that validates bearer tokens and tenant headers
pub async fn auth_middleware(
    State(config): State<Arc<AppConfig>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let trace_id = request
        .extensions()
        .get::<TraceContext>()
        .map(|ctx| ctx.trace_id.clone());

    let tenant = authenticate(&config, request.headers()).map_err(|mut err| {
        if let Some(trace_id) = trace_id {
            err.trace_id = Some(trace_id.into_boxed_str());
        }
        err
    })?;
    tracing::debug!(tenant_id = %tenant.0, "authenticated operator request");

    request.extensions_mut().insert(TenantExtension(tenant));
    request.extensions_mut().insert(OperatorAuth);

    Ok(next.run(request).await)
}

fn authenticate(config: &AppConfig, headers: &HeaderMap) -> Result<TenantId, ApiError> {
    let token = extract_bearer_token(headers)?;
    validate_token(config, token)?;
    extract_tenant_id(headers)
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| unauthorized(Some("Missing Authorization header")))?
        .to_str()
        .map_err(|_| unauthorized(Some("Invalid Authorization header")))?;

    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| unauthorized(Some("Authorization header must use Bearer scheme")))
}

fn validate_token(config: &AppConfig, token: &str) -> Result<(), ApiError> {
    let is_valid = config
        .operator_tokens
        .iter()
        .any(|configured| ConstantTimeEq::ct_eq(token.as_bytes(), configured.as_bytes()).into());

    if is_valid {
        Ok(())
    } else {
        Err(unauthorized(Some("Invalid bearer token")))
    }
}

fn extract_tenant_id(headers: &HeaderMap) -> Result<TenantId, ApiError> {
    let header_value = headers
        .get(TENANT_HEADER)
        .ok_or_else(|| {
            validation_error(
                "Missing required header",
                serde_json::json!({ TENANT_HEADER: "Required header is missing" }),
            )
        })?
        .to_str()
        .map_err(|_| {
            validation_error(
                "Invalid tenant header",
                serde_json::json!({ TENANT_HEADER: "Header must be valid UTF-8" }),
            )
        })?;

    header_value.trim().parse::<Uuid>().map(TenantId).map_err(|_| {
        validation_error(
            "Invalid tenant ID",
            serde_json::json!({ TENANT_HEADER: "Must be a valid UUID" }),
        )
    })
}

/// OpenAPI header parameter for X-Tenant-Id
#[derive(Debug, Serialize, Deserialize, IntoParams, utoipa::ToSchema)]
#[into_params(parameter_in = Header)]
pub struct TenantHeader {
    /// Tenant identifier (UUID) that scopes the request to a specific tenant
    #[serde(rename = "X-Tenant-Id")]
    #[param(rename = "X-Tenant-Id", value_type = String)]
    pub tenant_id: String,
}

impl<S> FromRequestParts<S> for TenantExtension
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TenantExtension>()
            .copied()
            .ok_or_else(|| {
                validation_error(
                    "Tenant context missing",
                    serde_json::json!({ TENANT_HEADER: "Tenant context not present" }),
                )
            })
    }
}

impl<S> FromRequestParts<S> for OperatorAuth
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<OperatorAuth>()
            .copied()
            .ok_or_else(|| unauthorized(Some("Operator authentication required")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode},
        routing::get,
    };
    use tower::ServiceExt;

    fn create_test_config() -> Arc<AppConfig> {
        Arc::new(AppConfig {
            operator_tokens: vec!["test-token-123".to_string()],
            ..Default::default()
        })
    }

    async fn run_middleware(config: Arc<AppConfig>, request: Request<Body>) -> Response {
        async fn handler(tenant: TenantExtension) -> String {
            tenant.id().to_string()
        }

        Router::new()
            .route("/test", get(handler))
            .layer(axum::middleware::from_fn_with_state(config, auth_middleware))
            .oneshot(request)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn missing_auth_header_returns_401() {
        let request = Request::builder()
            .uri("/test")
            .header(TENANT_HEADER, Uuid::new_v4().to_string())
            .body(Body::empty())
            .unwrap();

        let response = run_middleware(create_test_config(), request).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn invalid_auth_scheme_returns_401() {
        let request = Request::builder()
            .uri("/test")
            .header("Authorization", "Basic dGVzdDoxMjM=")
            .header(TENANT_HEADER, Uuid::new_v4().to_string())
            .body(Body::empty())
            .unwrap();

        let response = run_middleware(create_test_config(), request).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn invalid_token_returns_401() {
        let request = Request::builder()
            .uri("/test")
            .header("Authorization", "Bearer wrong-token")
            .header(TENANT_HEADER, Uuid::new_v4().to_string())
            .body(Body::empty())
            .unwrap();

        let response = run_middleware(create_test_config(), request).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_tenant_header_returns_400() {
        let request = Request::builder()
            .uri("/test")
            .header("Authorization", "Bearer test-token-123")
            .body(Body::empty())
            .unwrap();

        let response = run_middleware(create_test_config(), request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invalid_tenant_uuid_returns_400() {
        let request = Request::builder()
            .uri("/test")
            .header("Authorization", "Bearer test-token-123")
            .header(TENANT_HEADER, "not-a-uuid")
            .body(Body::empty())
            .unwrap();

        let response = run_middleware(create_test_config(), request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn valid_request_exposes_tenant_to_handler() {
        let tenant = Uuid::new_v4();
        let request = Request::builder()
            .uri("/test")
            .header("Authorization", "Bearer test-token-123")
            .header(TENANT_HEADER, tenant.to_string())
            .body(Body::empty())
            .unwrap();

        let response = run_middleware(create_test_config(), request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body, tenant.to_string().as_bytes());
    }

    #[tokio::test]
    async fn empty_token_list_rejects_everything() {
        let config = Arc::new(AppConfig::default());
        let request = Request::builder()
            .uri("/test")
            .header("Authorization", "Bearer anything")
            .header(TENANT_HEADER, Uuid::new_v4().to_string())
            .body(Body::empty())
            .unwrap();

        let response = run_middleware(config, request).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
