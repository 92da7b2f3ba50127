//! Tool-provider type definitions.
//!
//! Covers the JSON-RPC 2.0 envelope spoken by MCP servers, the
//! `tools/list` and `tools/call` payloads, and the provider-neutral shapes
//! the registry and the proxy endpoint hand back.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::BrokerError;

// ── JSON-RPC 2.0 ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

// ── MCP payloads ──────────────────────────────────────────────

/// A tool as advertised by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
    #[serde(rename = "nextCursor", default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallToolParams {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<McpContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: ResourceContent,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceContent {
    pub uri: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(rename = "mimeType", default)]
    pub mime_type: Option<String>,
}

impl CallToolResult {
    /// Collapse MCP content blocks: one text block becomes a string, several
    /// become an array of their texts.
    pub fn into_tool_result(self) -> ToolResult {
        let texts: Vec<String> = self
            .content
            .iter()
            .filter_map(|c| match c {
                McpContent::Text { text } if !text.is_empty() => Some(text.clone()),
                McpContent::Resource { resource } => resource.text.clone(),
                _ => None,
            })
            .collect();

        let content = match (self.content.len(), texts.len()) {
            (0, _) => Value::Null,
            (1, 1) => Value::String(texts.into_iter().next().unwrap_or_default()),
            (_, 0) => serde_json::to_value(&self.content).unwrap_or(Value::Null),
            _ => Value::from(texts),
        };
        ToolResult {
            content,
            is_error: self.is_error,
        }
    }
}

// ── Provider-neutral shapes ───────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Value,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedApp {
    pub app: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,
}

/// Short-lived token a user's browser uses to connect an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectToken {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_link_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Pipedream,
    Composio,
    Direct,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Pipedream => "pipedream",
            ProviderKind::Composio => "composio",
            ProviderKind::Direct => "direct",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pipedream" => Ok(ProviderKind::Pipedream),
            "composio" => Ok(ProviderKind::Composio),
            "direct" | "jsonrpc" => Ok(ProviderKind::Direct),
            other => Err(BrokerError::config(format!("unknown provider type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub base_url: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub apps: Vec<String>,
}

// ── Proxy endpoint ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMethod {
    ListTools,
    CallTool,
    ListApps,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyRequest {
    pub method: ProxyMethod,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub input: Option<Value>,
    /// Explicit provider, overriding any `provider:` prefix on `app`.
    #[serde(default)]
    pub provider: Option<String>,
}

impl ProxyRequest {
    /// The `provider:app` identifier this request routes on.
    pub fn target(&self) -> String {
        match &self.provider {
            Some(p) if !p.is_empty() => {
                let app = self.app.split_once(':').map(|(_, a)| a).unwrap_or(&self.app);
                format!("{}:{}", p, app)
            }
            _ => self.app.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl ProxyResponse {
    pub fn ok(data: Value, provider: Option<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            provider,
        }
    }

    pub fn failed(error: impl fmt::Display, provider: Option<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
            provider,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_jsonrpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "tools/list", None);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 1);
        assert_eq!(json["method"], "tools/list");
        assert!(json.get("params").is_none());
    }

    #[test]
    fn test_list_tools_result_deserialization() {
        let json = json!({
            "tools": [
                { "name": "send_email", "description": "Send mail", "inputSchema": { "type": "object" } },
                { "name": "ping" }
            ]
        });
        let result: ListToolsResult = serde_json::from_value(json).unwrap();
        assert_eq!(result.tools.len(), 2);
        assert_eq!(result.tools[0].description, "Send mail");
        assert_eq!(result.tools[1].description, "");
        assert!(result.tools[1].input_schema.is_none());
    }

    #[test]
    fn test_single_text_block_collapses_to_string() {
        let raw: CallToolResult = serde_json::from_value(json!({
            "content": [{ "type": "text", "text": "done" }],
            "isError": false
        }))
        .unwrap();
        let result = raw.into_tool_result();
        assert_eq!(result.content, json!("done"));
        assert!(!result.is_error);
    }

    #[test]
    fn test_multiple_text_blocks_become_array() {
        let raw: CallToolResult = serde_json::from_value(json!({
            "content": [
                { "type": "text", "text": "a" },
                { "type": "audio", "data": "..." },
                { "type": "text", "text": "b" }
            ],
            "isError": true
        }))
        .unwrap();
        let result = raw.into_tool_result();
        assert_eq!(result.content, json!(["a", "b"]));
        assert!(result.is_error);
    }

    #[test]
    fn test_image_only_content_is_kept_verbatim() {
        let raw: CallToolResult = serde_json::from_value(json!({
            "content": [{ "type": "image", "data": "aGk=", "mimeType": "image/png" }]
        }))
        .unwrap();
        let result = raw.into_tool_result();
        assert_eq!(result.content[0]["mimeType"], "image/png");
    }

    #[test]
    fn test_proxy_request_target_prefers_explicit_provider() {
        let req: ProxyRequest = serde_json::from_value(json!({
            "method": "list_tools",
            "app": "pipedream:github",
            "provider": "composio"
        }))
        .unwrap();
        assert_eq!(req.method, ProxyMethod::ListTools);
        assert_eq!(req.target(), "composio:github");

        let plain: ProxyRequest = serde_json::from_value(json!({ "method": "call_tool", "app": "gmail" })).unwrap();
        assert_eq!(plain.target(), "gmail");
    }

    #[test]
    fn test_proxy_response_omits_empty_fields() {
        let v = serde_json::to_value(ProxyResponse::failed("boom", None)).unwrap();
        assert_eq!(v, json!({ "success": false, "error": "boom" }));
    }
}
