//! Operator handlers for OAuth2 tool connections.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::{BrokerError, Result};
use crate::integrations::UserIntegration;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AuthUrlQuery {
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub user_id: String,
    pub code: String,
}

/// GET /api/integrations?user_id=
pub async fn list_integrations(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Json<Vec<UserIntegration>> {
    Json(state.integrations.list(&q.user_id).await)
}

/// GET /api/integrations/:integration/auth-url?state=
pub async fn auth_url(
    State(state): State<Arc<AppState>>,
    Path(integration): Path<String>,
    Query(q): Query<AuthUrlQuery>,
) -> Result<Json<Value>> {
    let handler = state
        .integrations
        .handler(&integration)
        .ok_or_else(|| BrokerError::not_found(format!("integration {}", integration)))?;
    Ok(Json(json!({ "url": handler.auth_url(&q.state)? })))
}

/// POST /api/integrations/:integration/connect
pub async fn connect(
    State(state): State<Arc<AppState>>,
    Path(integration): Path<String>,
    Json(req): Json<ConnectRequest>,
) -> Result<(StatusCode, Json<UserIntegration>)> {
    if req.code.is_empty() {
        return Err(BrokerError::validation("authorization code is required"));
    }
    state
        .integrations
        .connect_with_code(&req.user_id, &integration, &req.code)
        .await?;
    let connected = state
        .integrations
        .get(&req.user_id, &integration)
        .await
        .ok_or_else(|| BrokerError::not_found(format!("integration {}", integration)))?;
    Ok((StatusCode::CREATED, Json(connected)))
}

/// DELETE /api/integrations/:integration?user_id=
pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    Path(integration): Path<String>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Value>> {
    let removed = state.integrations.disconnect(&q.user_id, &integration).await?;
    tracing::info!(user_id = %q.user_id, integration = %integration, removed, "integration disconnected");
    Ok(Json(json!({ "integration": integration, "deleted": removed })))
}

#[cfg(test)]
mod tests {
    use super::super::router;
    use super::super::test_support::*;
    use crate::integrations::{GenericOAuth2Handler, OAuth2HandlerConfig};
    use crate::mcp::Registry;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_connect_list_disconnect() {
        let oauth = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("code=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "gho_secret", "refresh_token": "ghr_secret", "expires_in": 28800
            })))
            .expect(1)
            .mount(&oauth)
            .await;

        let state = state_with(Registry::new());
        state.integrations.register_handler(
            "github",
            Arc::new(GenericOAuth2Handler::new(OAuth2HandlerConfig {
                client_id: "cid".into(),
                client_secret: "csecret".into(),
                auth_url: "https://github.com/login/oauth/authorize".into(),
                token_url: format!("{}/token", oauth.uri()),
                redirect_url: "http://broker.test/callback".into(),
                scopes: vec!["repo".into()],
            })),
        );
        let app = router(state.clone());
        let admin = Some(("x-admin-key", ADMIN_KEY));

        let req = Request::get("/api/integrations/github/auth-url?state=xyz")
            .header("x-admin-key", ADMIN_KEY)
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["url"].as_str().unwrap().contains("state=xyz"));

        let (status, body) = send(
            &app,
            json_request(
                "POST",
                "/api/integrations/github/connect",
                admin,
                json!({ "userId": "u1", "code": "abc" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["integrationId"], "github");
        assert!(!body.to_string().contains("secret"));

        let req = Request::get("/api/integrations?user_id=u1")
            .header("x-admin-key", ADMIN_KEY)
            .body(Body::empty())
            .unwrap();
        let (_, body) = send(&app, req).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(state.integrations.get_access_token("u1", "github").await.unwrap(), "gho_secret");

        let req = Request::delete("/api/integrations/github?user_id=u1")
            .header("x-admin-key", ADMIN_KEY)
            .body(Body::empty())
            .unwrap();
        let (_, body) = send(&app, req).await;
        assert_eq!(body["deleted"], true);
    }

    #[tokio::test]
    async fn test_unknown_integration_is_404() {
        let app = router(state_with(Registry::new()));
        let req = Request::get("/api/integrations/notion/auth-url")
            .header("x-admin-key", ADMIN_KEY)
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, req).await.0, StatusCode::NOT_FOUND);
    }
}
