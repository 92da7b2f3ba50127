//! Tool proxy handlers.
//!
//! The proxy answers 200 with `success: false` when a provider fails, so a
//! sandbox can tell an upstream error from a rejected token.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::bearer_token;
use crate::auth::Scope;
use crate::errors::{BrokerError, Result};
use crate::mcp::types::{ProxyMethod, ProxyRequest, ProxyResponse};
use crate::mcp::{ConnectToken, McpError, ProviderInfo};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ProvidersResponse {
    pub providers: Vec<ProviderInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTokenRequest {
    pub user_id: String,
    #[serde(default)]
    pub provider: Option<String>,
}

fn required_scope(method: ProxyMethod) -> Scope {
    match method {
        ProxyMethod::ListTools => Scope::ListTools,
        ProxyMethod::CallTool => Scope::CallTools,
        ProxyMethod::ListApps => Scope::ListApps,
    }
}

fn to_value<T: Serialize>(value: T) -> std::result::Result<Value, McpError> {
    serde_json::to_value(value).map_err(|e| McpError::Decode(e.to_string()))
}

/// POST /api/mcp/proxy
pub async fn proxy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ProxyRequest>,
) -> Result<Json<ProxyResponse>> {
    let claims = state
        .issuer
        .validate_with_scope(bearer_token(&headers)?, required_scope(req.method))?;
    if req.method == ProxyMethod::CallTool && req.tool.is_empty() {
        return Err(BrokerError::validation("tool is required for call_tool"));
    }

    let target = req.target();
    let user_id = claims.user_id.as_str();
    let registry = &state.registry;

    let (provider, result) = match req.method {
        ProxyMethod::ListApps => (None, registry.list_connected_apps(user_id).await.and_then(to_value)),
        ProxyMethod::ListTools | ProxyMethod::CallTool => match registry.parse_provider_app(&target).await {
            (name, _) if name.is_empty() => (None, Err(McpError::NotFound("no default provider configured".into()))),
            (name, _) => {
                let result = if req.method == ProxyMethod::ListTools {
                    registry.list_tools(user_id, &target).await.and_then(to_value)
                } else {
                    let input = req.input.clone().unwrap_or_else(|| Value::Object(Default::default()));
                    registry.call_tool(user_id, &target, &req.tool, input).await.and_then(to_value)
                };
                (Some(name), result)
            }
        },
    };

    Ok(Json(match result {
        Ok(data) => ProxyResponse::ok(data, provider),
        Err(e) => {
            tracing::warn!(
                user_id = %user_id,
                sandbox_id = %claims.sandbox_id,
                target = %target,
                error = %e,
                "tool proxy request failed"
            );
            ProxyResponse::failed(e, provider)
        }
    }))
}

/// GET /api/mcp/providers. Any valid session token may list providers.
pub async fn list_providers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ProvidersResponse>> {
    state.issuer.validate(bearer_token(&headers)?)?;
    Ok(Json(ProvidersResponse {
        providers: state.registry.list_providers().await,
        default: state.registry.default_provider().await,
    }))
}

/// POST /api/mcp/connect-token
pub async fn connect_token(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConnectTokenRequest>,
) -> Result<Json<ConnectToken>> {
    let token = state
        .registry
        .get_connect_token(&req.user_id, req.provider.as_deref())
        .await
        .map_err(BrokerError::from)?;
    Ok(Json(token))
}
