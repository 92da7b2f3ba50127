//! Pipedream Connect: hosted MCP for thousands of apps, addressed per user
//! through `x-pd-*` headers.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::provider::Provider;
use super::transport::{self, RequestIds};
use super::types::{CallToolParams, CallToolResult, ConnectToken, ConnectedApp, ListToolsResult, ProviderInfo, ProviderKind, Tool, ToolResult};
use super::{http_client, read_json, McpError};

pub const MCP_URL: &str = "https://remote.mcp.pipedream.net";
pub const API_URL: &str = "https://api.pipedream.com/v1";

/// Cached tokens are dropped this long before the upstream expiry.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

#[derive(Deserialize)]
struct AccountsResponse {
    #[serde(default)]
    data: Vec<Account>,
}

#[derive(Deserialize)]
struct Account {
    id: String,
    #[serde(default)]
    name: String,
    app: AccountApp,
}

#[derive(Deserialize)]
struct AccountApp {
    name_slug: String,
}

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

pub struct PipedreamProvider {
    client_id: String,
    client_secret: String,
    project_id: String,
    environment: String,
    mcp_url: String,
    api_url: String,
    http: Client,
    ids: RequestIds,
    token: Mutex<Option<CachedToken>>,
}

impl PipedreamProvider {
    pub fn new(client_id: &str, client_secret: &str, project_id: &str, environment: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            project_id: project_id.to_string(),
            environment: environment.to_string(),
            mcp_url: MCP_URL.to_string(),
            api_url: API_URL.to_string(),
            http: http_client(),
            ids: RequestIds::default(),
            token: Mutex::new(None),
        }
    }

    pub fn with_mcp_url(mut self, url: &str) -> Self {
        self.mcp_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Overrides the Connect REST base, which also hosts the OAuth token endpoint.
    pub fn with_api_url(mut self, url: &str) -> Self {
        self.api_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Client-credentials token, cached until shortly before it expires.
    /// Concurrent callers wait on one fetch.
    async fn access_token(&self) -> Result<String, McpError> {
        let mut cached = self.token.lock().await;
        if let Some(t) = cached.as_ref() {
            if Utc::now() < t.expires_at {
                return Ok(t.value.clone());
            }
        }

        let resp = self
            .http
            .post(format!("{}/oauth/token", self.api_url))
            .json(&json!({
                "grant_type": "client_credentials",
                "client_id": self.client_id,
                "client_secret": self.client_secret,
            }))
            .send()
            .await?;
        let token: OAuthTokenResponse = read_json(resp).await?;
        let ttl = (token.expires_in - TOKEN_EXPIRY_MARGIN_SECS).max(0);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Utc::now() + Duration::seconds(ttl),
        });
        tracing::debug!(project_id = %self.project_id, ttl_secs = ttl, "pipedream access token refreshed");
        Ok(token.access_token)
    }

    async fn mcp_request(&self, user_id: &str, app: &str, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let token = self.access_token().await?;
        let mut request = self
            .http
            .post(&self.mcp_url)
            .bearer_auth(token)
            .header("x-pd-project-id", &self.project_id)
            .header("x-pd-environment", &self.environment)
            .header("x-pd-external-user-id", user_id);
        if !app.is_empty() {
            request = request.header("x-pd-app-slug", app);
        }
        Ok(transport::send(request, self.ids.next(), method, params).await?.result)
    }
}

#[async_trait]
impl Provider for PipedreamProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "pipedream".into(),
            kind: ProviderKind::Pipedream,
            description: "Pipedream MCP - Connect to 2000+ apps".into(),
            base_url: self.mcp_url.clone(),
            apps: ["gmail", "google_calendar", "slack", "notion", "github", "linear_app", "discord", "twitter"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    fn name(&self) -> &str {
        "pipedream"
    }

    async fn list_tools(&self, user_id: &str, app: &str) -> Result<Vec<Tool>, McpError> {
        let result = self.mcp_request(user_id, app, "tools/list", None).await?;
        let page: ListToolsResult =
            serde_json::from_value(result).map_err(|e| McpError::Decode(format!("tools/list: {}", e)))?;
        Ok(page.tools)
    }

    async fn call_tool(&self, user_id: &str, app: &str, tool: &str, input: Value) -> Result<ToolResult, McpError> {
        let params = serde_json::to_value(CallToolParams {
            name: tool.to_string(),
            arguments: input,
        })
        .map_err(|e| McpError::Decode(e.to_string()))?;
        let result = self.mcp_request(user_id, app, "tools/call", Some(params)).await?;
        let call: CallToolResult =
            serde_json::from_value(result).map_err(|e| McpError::Decode(format!("tools/call: {}", e)))?;
        Ok(call.into_tool_result())
    }

    async fn get_connect_token(&self, user_id: &str) -> Result<ConnectToken, McpError> {
        let token = self.access_token().await?;
        let resp = self
            .http
            .post(format!("{}/connect/{}/tokens", self.api_url, self.project_id))
            .bearer_auth(token)
            .header("x-pd-environment", &self.environment)
            .json(&json!({ "external_user_id": user_id }))
            .send()
            .await?;
        read_json(resp).await
    }

    async fn list_connected_apps(&self, user_id: &str) -> Result<Vec<ConnectedApp>, McpError> {
        let token = self.access_token().await?;
        let resp = self
            .http
            .get(format!("{}/connect/{}/accounts", self.api_url, self.project_id))
            .query(&[("external_user_id", user_id)])
            .bearer_auth(token)
            .header("x-pd-environment", &self.environment)
            .send()
            .await?;
        let accounts: AccountsResponse = read_json(resp).await?;
        Ok(accounts
            .data
            .into_iter()
            .map(|a| ConnectedApp {
                app: a.app.name_slug,
                account_id: a.id,
                name: a.name,
                provider: String::new(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_token(server: &MockServer, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_partial_json(json!({ "grant_type": "client_credentials", "client_id": "cid" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "pd-token", "expires_in": 3600
            })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    fn provider(server: &MockServer) -> PipedreamProvider {
        PipedreamProvider::new("cid", "csecret", "proj_1", "development")
            .with_api_url(&server.uri())
            .with_mcp_url(&format!("{}/mcp", server.uri()))
    }

    #[tokio::test]
    async fn test_list_tools_sends_user_headers_and_caches_token() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header("authorization", "Bearer pd-token"))
            .and(header("x-pd-project-id", "proj_1"))
            .and(header("x-pd-external-user-id", "user1"))
            .and(header("x-pd-app-slug", "gmail"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "result": { "tools": [{ "name": "gmail-send-email", "description": "Send an email" }] }
            })))
            .expect(2)
            .mount(&server)
            .await;

        let p = provider(&server);
        for _ in 0..2 {
            let tools = p.list_tools("user1", "gmail").await.unwrap();
            assert_eq!(tools[0].name, "gmail-send-email");
        }
    }

    #[tokio::test]
    async fn test_connected_apps_and_connect_token() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/connect/proj_1/accounts"))
            .and(query_param("external_user_id", "user1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "id": "apn_1", "name": "me@example.com", "app": { "name_slug": "gmail", "name": "Gmail" } }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/connect/proj_1/tokens"))
            .and(body_partial_json(json!({ "external_user_id": "user1" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "token": "ctok_1",
                "connect_link_url": "https://pipedream.com/_static/connect.html?token=ctok_1",
                "expires_at": "2030-01-01T00:00:00Z"
            })))
            .mount(&server)
            .await;

        let p = provider(&server);
        let apps = p.list_connected_apps("user1").await.unwrap();
        assert_eq!(apps[0].app, "gmail");
        assert_eq!(apps[0].account_id, "apn_1");

        let token = p.get_connect_token("user1").await.unwrap();
        assert_eq!(token.token, "ctok_1");
        assert!(token.connect_link_url.unwrap().contains("ctok_1"));
    }

    #[tokio::test]
    async fn test_token_endpoint_failure_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
            .mount(&server)
            .await;
        let err = provider(&server).list_tools("user1", "gmail").await.unwrap_err();
        assert!(matches!(err, McpError::Status { status: 401, .. }));
    }
}
