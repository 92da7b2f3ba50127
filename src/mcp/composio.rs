//! Composio REST provider. Tools are grouped into toolkits; execution is a
//! plain POST rather than JSON-RPC.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::provider::Provider;
use super::types::{ConnectToken, ConnectedApp, ProviderInfo, ProviderKind, Tool, ToolResult};
use super::{http_client, read_json, McpError};

pub const API_URL: &str = "https://backend.composio.dev/api/v3";

#[derive(Deserialize)]
struct ToolsPage {
    #[serde(default)]
    items: Vec<ToolItem>,
}

#[derive(Deserialize)]
struct ToolItem {
    slug: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: ToolParameters,
}

#[derive(Default, Deserialize)]
struct ToolParameters {
    #[serde(default)]
    properties: Map<String, Value>,
    #[serde(default)]
    required: Vec<String>,
}

#[derive(Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    data: Value,
    #[serde(default)]
    successful: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct SessionResponse {
    #[serde(default)]
    token: String,
    #[serde(default, rename = "redirectUrl")]
    redirect_url: String,
}

#[derive(Deserialize)]
struct AccountsPage {
    #[serde(default)]
    items: Vec<AccountItem>,
}

#[derive(Deserialize)]
struct AccountItem {
    id: String,
    #[serde(default)]
    status: String,
    toolkit: Toolkit,
}

#[derive(Deserialize)]
struct Toolkit {
    slug: String,
    #[serde(default)]
    name: String,
}

pub struct ComposioProvider {
    api_key: String,
    project_id: String,
    api_url: String,
    http: Client,
}

impl ComposioProvider {
    pub fn new(api_key: &str, project_id: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            project_id: project_id.to_string(),
            api_url: API_URL.to_string(),
            http: http_client(),
        }
    }

    pub fn with_api_url(mut self, url: &str) -> Self {
        self.api_url = url.trim_end_matches('/').to_string();
        self
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{}", self.api_url, path))
            .header("x-api-key", &self.api_key)
            .header("Accept", "application/json")
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}{}", self.api_url, path))
            .header("x-api-key", &self.api_key)
            .header("Accept", "application/json")
    }
}

/// Normalise common app names to Composio toolkit slugs.
pub fn map_toolkit(app: &str) -> String {
    let app = app.to_lowercase();
    let mapped = match app.as_str() {
        "google_calendar" | "googlecalendar" => "googlecalendar",
        "linear_app" | "linear" => "linear",
        "google_drive" | "googledrive" => "googledrive",
        _ => return app,
    };
    mapped.to_string()
}

#[async_trait]
impl Provider for ComposioProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "composio".into(),
            kind: ProviderKind::Composio,
            description: "Composio - 300+ app integrations with comprehensive API coverage".into(),
            base_url: self.api_url.clone(),
            apps: [
                "gmail", "googlecalendar", "slack", "notion", "github", "linear", "jira", "asana", "trello", "hubspot",
                "airtable", "discord", "zoom",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }

    fn name(&self) -> &str {
        "composio"
    }

    async fn list_tools(&self, _user_id: &str, app: &str) -> Result<Vec<Tool>, McpError> {
        let toolkit = map_toolkit(app);
        let resp = self
            .get("/tools")
            .query(&[("toolkit_slug", toolkit.as_str()), ("limit", "100")])
            .send()
            .await?;
        let page: ToolsPage = read_json(resp).await?;
        Ok(page
            .items
            .into_iter()
            .map(|t| Tool {
                name: t.slug,
                description: t.description,
                input_schema: Some(json!({
                    "type": "object",
                    "properties": t.parameters.properties,
                    "required": t.parameters.required,
                })),
            })
            .collect())
    }

    async fn call_tool(&self, user_id: &str, _app: &str, tool: &str, input: Value) -> Result<ToolResult, McpError> {
        let resp = self
            .post(&format!("/tools/execute/{}", urlencoding::encode(tool)))
            .json(&json!({ "arguments": input, "user_id": user_id }))
            .send()
            .await?;
        let exec: ExecuteResponse = read_json(resp).await?;
        let error = exec.error.filter(|e| !e.is_empty());
        if !exec.successful || error.is_some() {
            return Ok(ToolResult {
                content: Value::String(error.unwrap_or_else(|| "tool execution failed".into())),
                is_error: true,
            });
        }
        Ok(ToolResult {
            content: exec.data,
            is_error: false,
        })
    }

    async fn get_connect_token(&self, user_id: &str) -> Result<ConnectToken, McpError> {
        let resp = self
            .post("/auth/session")
            .json(&json!({ "user_id": user_id, "project_id": self.project_id }))
            .send()
            .await?;
        let session: SessionResponse = read_json(resp).await?;
        if session.token.is_empty() && session.redirect_url.is_empty() {
            return Err(McpError::Decode("composio returned neither token nor redirect URL".into()));
        }
        Ok(ConnectToken {
            token: session.token,
            connect_link_url: Some(session.redirect_url).filter(|u| !u.is_empty()),
            expires_at: None,
        })
    }

    async fn list_connected_apps(&self, user_id: &str) -> Result<Vec<ConnectedApp>, McpError> {
        let resp = self.get("/connected_accounts").query(&[("user_id", user_id)]).send().await?;
        let page: AccountsPage = read_json(resp).await?;
        Ok(page
            .items
            .into_iter()
            .filter(|a| a.status.eq_ignore_ascii_case("active"))
            .map(|a| ConnectedApp {
                name: if a.toolkit.name.is_empty() {
                    a.toolkit.slug.clone()
                } else {
                    a.toolkit.name
                },
                app: a.toolkit.slug,
                account_id: a.id,
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

    #[test]
    fn test_map_toolkit() {
        assert_eq!(map_toolkit("Google_Calendar"), "googlecalendar");
        assert_eq!(map_toolkit("linear_app"), "linear");
        assert_eq!(map_toolkit("GitHub"), "github");
        assert_eq!(map_toolkit("salesforce"), "salesforce");
    }

    #[tokio::test]
    async fn test_list_tools_builds_object_schema() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tools"))
            .and(query_param("toolkit_slug", "googlecalendar"))
            .and(header("x-api-key", "ck"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{
                    "slug": "GOOGLECALENDAR_CREATE_EVENT",
                    "name": "Create event",
                    "description": "Create a calendar event",
                    "parameters": { "properties": { "title": { "type": "string" } }, "required": ["title"] }
                }]
            })))
            .mount(&server)
            .await;

        let p = ComposioProvider::new("ck", "").with_api_url(&server.uri());
        let tools = p.list_tools("u1", "google_calendar").await.unwrap();
        assert_eq!(tools[0].name, "GOOGLECALENDAR_CREATE_EVENT");
        let schema = tools[0].input_schema.as_ref().unwrap();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"][0], "title");
    }

    #[tokio::test]
    async fn test_call_tool_maps_unsuccessful_execution_to_error_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tools/execute/GITHUB_STAR_REPO"))
            .and(body_partial_json(json!({ "user_id": "u1", "arguments": { "repo": "x/y" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {}, "successful": false, "error": "repo not found"
            })))
            .mount(&server)
            .await;

        let p = ComposioProvider::new("ck", "").with_api_url(&server.uri());
        let result = p.call_tool("u1", "github", "GITHUB_STAR_REPO", json!({ "repo": "x/y" })).await.unwrap();
        assert!(result.is_error);
        assert_eq!(result.content, json!("repo not found"));
    }

    #[tokio::test]
    async fn test_connected_apps_only_active() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/connected_accounts"))
            .and(query_param("user_id", "u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    { "id": "ca_1", "status": "ACTIVE", "toolkit": { "slug": "github", "name": "GitHub" } },
                    { "id": "ca_2", "status": "INITIATED", "toolkit": { "slug": "slack" } },
                    { "id": "ca_3", "status": "active", "toolkit": { "slug": "notion" } }
                ]
            })))
            .mount(&server)
            .await;

        let p = ComposioProvider::new("ck", "").with_api_url(&server.uri());
        let apps = p.list_connected_apps("u1").await.unwrap();
        let names: Vec<_> = apps.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["GitHub", "notion"]);
    }
}
