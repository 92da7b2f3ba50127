use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::composio::ComposioProvider;
use super::direct::DirectProvider;
use super::pipedream::PipedreamProvider;
use super::types::{ConnectToken, ConnectedApp, ProviderInfo, ProviderKind, Tool, ToolResult};
use super::McpError;
use crate::errors::{BrokerError, Result};

/// A backend that lists and executes tools on a user's behalf.
#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    fn name(&self) -> &str;

    async fn list_tools(&self, user_id: &str, app: &str) -> std::result::Result<Vec<Tool>, McpError>;

    async fn call_tool(
        &self,
        user_id: &str,
        app: &str,
        tool: &str,
        input: Value,
    ) -> std::result::Result<ToolResult, McpError>;

    /// Token for connecting a new account. Not every backend has one.
    async fn get_connect_token(&self, user_id: &str) -> std::result::Result<ConnectToken, McpError>;

    async fn list_connected_apps(&self, user_id: &str) -> std::result::Result<Vec<ConnectedApp>, McpError>;
}

/// Per-user bearer tokens for providers that authenticate as the user.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self, user_id: &str) -> Result<String>;
}

/// Configuration-driven provider construction.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub kind: Option<ProviderKind>,
    /// Registry name; defaults to the kind.
    #[serde(default)]
    pub name: String,
    /// Direct: the MCP endpoint. Pipedream/Composio: REST API override.
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub project_id: String,
    /// Provider-specific settings (`clientId`, `clientSecret`, `environment`, `mcpUrl`).
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind, name: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            name: name.into(),
            ..Default::default()
        }
    }

    fn extra(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn registry_name(&self) -> String {
        match (&self.kind, self.name.is_empty()) {
            (Some(kind), true) => kind.as_str().to_string(),
            _ => self.name.clone(),
        }
    }
}

/// Build a provider from its type tag.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
    let kind = config
        .kind
        .ok_or_else(|| BrokerError::config("provider type is required"))?;
    let name = config.registry_name();

    let provider: Arc<dyn Provider> = match kind {
        ProviderKind::Pipedream => {
            let client_id = config
                .extra("clientId")
                .ok_or_else(|| BrokerError::config("pipedream requires clientId"))?;
            let client_secret = config
                .extra("clientSecret")
                .ok_or_else(|| BrokerError::config("pipedream requires clientSecret"))?;
            if config.project_id.is_empty() {
                return Err(BrokerError::config("pipedream requires projectId"));
            }
            let mut p = PipedreamProvider::new(
                client_id,
                client_secret,
                &config.project_id,
                config.extra("environment").unwrap_or("development"),
            );
            if !config.base_url.is_empty() {
                p = p.with_api_url(&config.base_url);
            }
            if let Some(mcp) = config.extra("mcpUrl") {
                p = p.with_mcp_url(mcp);
            }
            Arc::new(p)
        }
        ProviderKind::Composio => {
            if config.api_key.is_empty() {
                return Err(BrokerError::config("composio requires apiKey"));
            }
            let mut p = ComposioProvider::new(&config.api_key, &config.project_id);
            if !config.base_url.is_empty() {
                p = p.with_api_url(&config.base_url);
            }
            Arc::new(p)
        }
        ProviderKind::Direct => {
            if config.base_url.is_empty() {
                return Err(BrokerError::config(format!("direct provider {} requires baseUrl", name)));
            }
            let key = (!config.api_key.is_empty()).then(|| config.api_key.clone());
            Arc::new(DirectProvider::new(&name, &config.base_url, key))
        }
    };
    Ok(provider)
}
