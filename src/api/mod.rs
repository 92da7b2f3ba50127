use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;

use crate::errors::AuthError;
use crate::AppState;

pub mod cloud_handlers;
pub mod integration_handlers;
pub mod mcp_handlers;

/// Build the broker router.
///
/// Operator routes sit behind the admin key. Sandbox routes authenticate
/// with the session token in `Authorization: Bearer` and nothing else.
pub fn router(state: Arc<AppState>) -> Router {
    let operator = Router::new()
        .route("/api/auth/session-token", post(cloud_handlers::issue_session_token))
        .route("/api/cloud/credentials", get(cloud_handlers::list_credentials))
        .route(
            "/api/cloud/credentials/:provider",
            put(cloud_handlers::store_credentials).delete(cloud_handlers::delete_credentials),
        )
        .route("/api/cloud/sandbox-config", post(cloud_handlers::sandbox_config))
        .route("/api/mcp/connect-token", post(mcp_handlers::connect_token))
        .route("/api/integrations", get(integration_handlers::list_integrations))
        .route("/api/integrations/:integration", delete(integration_handlers::disconnect))
        .route("/api/integrations/:integration/auth-url", get(integration_handlers::auth_url))
        .route("/api/integrations/:integration/connect", post(integration_handlers::connect))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth));

    let sandbox = Router::new()
        // `/api/cloud/{provider}/credentials` and `/api/cloud/gcp/subject-token`
        .route("/api/cloud/:provider/:action", post(cloud_handlers::sandbox_request))
        .route("/api/mcp/proxy", post(mcp_handlers::proxy))
        .route("/api/mcp/providers", get(mcp_handlers::list_providers));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(operator)
        .merge(sandbox)
        .fallback(fallback_404)
        .with_state(state)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn(no_store_middleware))
}

/// Middleware: tags every response with a fresh `x-request-id` for log
/// correlation.
async fn request_id_middleware(req: Request, next: Next) -> Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

/// Middleware: responses carry credentials, so nothing may cache them.
async fn no_store_middleware(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert("cache-control", HeaderValue::from_static("no-store"));
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    resp
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Session token from `Authorization: Bearer`.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingToken)
}

/// Loggable form of a token or key: first 8 characters only.
pub(crate) fn mask(secret: &str) -> String {
    match secret.char_indices().nth(8) {
        Some((idx, _)) => format!("{}...", &secret[..idx]),
        None => "****".to_string(),
    }
}

/// Middleware: `x-admin-key` or `Authorization: Bearer` must match the
/// configured admin key.
async fn admin_auth(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let provided = req
        .headers()
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| bearer_token(req.headers()).ok().map(str::to_string));

    match provided {
        Some(k) if bool::from(k.as_bytes().ct_eq(state.config.admin_key().as_bytes())) => Ok(next.run(req).await),
        Some(k) => {
            tracing::warn!(provided = %mask(&k), path = %req.uri().path(), "operator API: invalid admin key");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::warn!(path = %req.uri().path(), "operator API: missing admin key");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::mcp::Registry;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[test]
    fn test_mask_keeps_eight_chars() {
        assert_eq!(mask("eyJhbGciOiJIUzI1NiJ9.payload"), "eyJhbGci...");
        assert_eq!(mask("short"), "****");
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), Err(AuthError::MissingToken));
        headers.insert("authorization", "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Ok("abc"));
        headers.insert("authorization", "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Err(AuthError::MissingToken));
    }

    #[tokio::test]
    async fn test_healthz_and_unknown_route() {
        let app = router(state_with(Registry::new()));
        let resp = app
            .clone()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["cache-control"], "no-store");
        assert!(resp.headers().contains_key("x-request-id"));

        let (status, _) = send(&app, Request::get("/nope").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_operator_routes_require_admin_key() {
        let app = router(state_with(Registry::new()));
        let uri = "/api/cloud/credentials?user_id=u1";

        let (status, _) = send(&app, Request::get(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let req = Request::get(uri).header("x-admin-key", "wrong-key-123").body(Body::empty()).unwrap();
        assert_eq!(send(&app, req).await.0, StatusCode::UNAUTHORIZED);

        let req = Request::get(uri).header("x-admin-key", ADMIN_KEY).body(Body::empty()).unwrap();
        assert_eq!(send(&app, req).await.0, StatusCode::OK);

        let req = Request::get(uri)
            .header("authorization", format!("Bearer {}", ADMIN_KEY))
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, req).await.0, StatusCode::OK);
    }
}
