//! Direct provider: one MCP server spoken to over Streamable HTTP.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde_json::{json, Value};

use super::provider::{Provider, TokenSource};
use super::transport::{self, RequestIds};
use super::types::{CallToolParams, CallToolResult, ConnectToken, ConnectedApp, ListToolsResult, ProviderInfo, ProviderKind, Tool, ToolResult};
use super::{http_client, McpError};

pub struct DirectProvider {
    name: String,
    endpoint: String,
    api_key: Option<String>,
    token_source: Option<Arc<dyn TokenSource>>,
    http: Client,
    ids: RequestIds,
    /// Session IDs assigned by the server, per user, echoed on that user's
    /// later requests.
    sessions: DashMap<String, String>,
}

impl DirectProvider {
    pub fn new(name: &str, endpoint: &str, api_key: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            token_source: None,
            http: http_client(),
            ids: RequestIds::default(),
            sessions: DashMap::new(),
        }
    }

    /// Authenticate each call as the calling user instead of with a static key.
    pub fn with_token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.token_source = Some(source);
        self
    }

    async fn rpc(&self, user_id: &str, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let mut request = self.http.post(&self.endpoint);

        let token = match &self.token_source {
            Some(source) => Some(source.access_token(user_id).await?),
            None => self.api_key.clone(),
        };
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            request = request.bearer_auth(token);
        }
        let session = self.sessions.get(user_id).map(|s| s.value().clone());
        if let Some(sid) = session {
            request = request.header(transport::SESSION_HEADER, sid);
        }

        let reply = transport::send(request, self.ids.next(), method, params).await?;
        if let Some(sid) = reply.session_id {
            self.sessions.insert(user_id.to_string(), sid);
        }
        Ok(reply.result)
    }
}

#[async_trait]
impl Provider for DirectProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.name.clone(),
            kind: ProviderKind::Direct,
            description: format!("Direct MCP server at {}", self.endpoint),
            base_url: self.endpoint.clone(),
            apps: Vec::new(),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self, user_id: &str, _app: &str) -> Result<Vec<Tool>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self.rpc(user_id, "tools/list", params).await?;
            let page: ListToolsResult =
                serde_json::from_value(result).map_err(|e| McpError::Decode(format!("tools/list: {}", e)))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => break,
            }
        }
        Ok(tools)
    }

    async fn call_tool(&self, user_id: &str, _app: &str, tool: &str, input: Value) -> Result<ToolResult, McpError> {
        let params = serde_json::to_value(CallToolParams {
            name: tool.to_string(),
            arguments: input,
        })
        .map_err(|e| McpError::Decode(e.to_string()))?;
        let result = self.rpc(user_id, "tools/call", Some(params)).await?;
        let call: CallToolResult =
            serde_json::from_value(result).map_err(|e| McpError::Decode(format!("tools/call: {}", e)))?;
        Ok(call.into_tool_result())
    }

    async fn get_connect_token(&self, _user_id: &str) -> Result<ConnectToken, McpError> {
        Err(McpError::Unsupported("direct MCP servers don't support connect tokens".into()))
    }

    /// A direct server is a single app.
    async fn list_connected_apps(&self, _user_id: &str) -> Result<Vec<ConnectedApp>, McpError> {
        Ok(vec![ConnectedApp {
            app: self.name.clone(),
            account_id: String::new(),
            name: self.name.clone(),
            provider: self.name.clone(),
        }])
    }
}
