//! Cloud credential handlers: operator CRUD, sandbox credential fetch and the
//! GCP executable-source endpoint.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{bearer_token, mask};
use crate::auth::Scope;
use crate::cloud::helpers::{ExecutableResponse, SandboxConfig};
use crate::cloud::types::StoredCredential;
use crate::cloud::{CredentialConfig, CredentialRequest, CredentialResponse, ProviderType};
use crate::errors::{BrokerError, Result};
use crate::AppState;

// ── Request / Response types ───────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueTokenRequest {
    pub user_id: String,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub sandbox_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Capped at the configured maximum.
    #[serde(default)]
    pub ttl_secs: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueTokenResponse {
    pub token: String,
    pub expires_at: String,
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: String,
    /// Display name for a stored record; defaults to the provider.
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchCredentialsBody {
    pub sandbox_id: String,
    #[serde(default)]
    pub provider: Option<ProviderType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfigRequest {
    pub user_id: String,
    pub sandbox_id: String,
    #[serde(default)]
    pub conversation_id: String,
}

fn parse_scopes(raw: &[String]) -> Result<Vec<Scope>> {
    raw.iter()
        .map(|s| Scope::parse(s).ok_or_else(|| BrokerError::validation(format!("unknown scope: {}", s))))
        .collect()
}

// ── Operator handlers ──────────────────────────────────────────

/// POST /api/auth/session-token
pub async fn issue_session_token(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IssueTokenRequest>,
) -> Result<(StatusCode, Json<IssueTokenResponse>)> {
    let scopes = parse_scopes(&req.scopes)?;
    let ttl = req.ttl_secs.unwrap_or_else(|| state.issuer.default_ttl_secs());
    let token = state
        .issuer
        .issue_with_ttl(&req.user_id, &req.conversation_id, &req.sandbox_id, &scopes, ttl)?;
    let claims = state.issuer.validate(&token)?;
    let expires_at = Utc
        .timestamp_opt(claims.exp, 0)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();

    tracing::info!(
        user_id = %req.user_id,
        sandbox_id = %req.sandbox_id,
        scopes = ?req.scopes,
        token = %mask(&token),
        "issued session token"
    );
    Ok((StatusCode::CREATED, Json(IssueTokenResponse { token, expires_at })))
}

/// GET /api/cloud/credentials?user_id=
pub async fn list_credentials(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<StoredCredential>>> {
    Ok(Json(state.cloud.list(&q.user_id).await?))
}

/// PUT /api/cloud/credentials/:provider?user_id=
///
/// The body is the provider's settings object, validated before storage.
pub async fn store_credentials(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(q): Query<UserQuery>,
    Json(settings): Json<Value>,
) -> Result<(StatusCode, Json<Value>)> {
    let provider = ProviderType::from_str(&provider)?;
    let config: CredentialConfig = serde_json::from_value(json!({
        "provider": provider.as_str(),
        "settings": settings,
    }))
    .map_err(|e| BrokerError::validation(format!("invalid {} settings: {}", provider, e)))?;

    let name = q.name.unwrap_or_else(|| provider.to_string());
    state.cloud.store_credentials(&q.user_id, &name, config).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "provider": provider, "name": name, "stored": true })),
    ))
}

/// DELETE /api/cloud/credentials/:provider?user_id=
pub async fn delete_credentials(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Value>> {
    let provider = ProviderType::from_str(&provider)?;
    let deleted = state.cloud.delete(&q.user_id, provider).await?;
    Ok(Json(json!({ "provider": provider, "deleted": deleted })))
}

/// POST /api/cloud/sandbox-config
pub async fn sandbox_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SandboxConfigRequest>,
) -> Result<Json<SandboxConfig>> {
    let bundle = state
        .cloud
        .sandbox_config(&req.user_id, &req.sandbox_id, &req.conversation_id)
        .await?;
    Ok(Json(bundle))
}

// ── Sandbox handlers ───────────────────────────────────────────

/// POST /api/cloud/:provider/:action
pub async fn sandbox_request(
    State(state): State<Arc<AppState>>,
    Path((provider, action)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<FetchCredentialsBody>,
) -> Result<Response> {
    match action.as_str() {
        "credentials" => Ok(fetch_credentials(&state, &provider, &headers, body).await?.into_response()),
        "subject-token" if provider == "gcp" => Ok(gcp_subject_token(&state, &headers, body)?.into_response()),
        _ => Err(BrokerError::not_found(format!("/api/cloud/{}/{}", provider, action))),
    }
}

/// Token failures are HTTP errors. A failed exchange still answers 200 with
/// the `error` field set.
async fn fetch_credentials(
    state: &AppState,
    provider: &str,
    headers: &HeaderMap,
    body: FetchCredentialsBody,
) -> Result<Json<CredentialResponse>> {
    let provider = ProviderType::from_str(provider)?;
    if matches!(body.provider, Some(p) if p != provider) {
        return Err(BrokerError::validation("provider in body does not match path"));
    }
    let session_token = bearer_token(headers)?.to_string();
    let req = CredentialRequest {
        sandbox_id: body.sandbox_id,
        provider,
        session_token,
    };
    Ok(Json(state.cloud.get_credentials(&req).await?))
}

/// Executable-source output for GCP workload identity federation.
fn gcp_subject_token(state: &AppState, headers: &HeaderMap, body: FetchCredentialsBody) -> Result<Json<ExecutableResponse>> {
    let session_token = bearer_token(headers)?;
    Ok(Json(state.cloud.gcp_executable_response(session_token, &body.sandbox_id)?))
}
