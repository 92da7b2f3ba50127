//! Pluggable tool providers and the registry that routes `provider:app`
//! identifiers to them.

pub mod composio;
pub mod direct;
pub mod pipedream;
pub mod provider;
pub mod registry;
pub mod transport;
pub mod types;

use thiserror::Error;

use crate::errors::BrokerError;

pub use provider::{create_provider, Provider, ProviderConfig, TokenSource};
pub use registry::Registry;
pub use types::{ConnectToken, ConnectedApp, ProviderInfo, ProviderKind, Tool, ToolResult};

/// Tool-call timeout; tool providers may run slow third-party actions.
pub const TOOL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum McpError {
    #[error("MCP request failed: {0}")]
    Transport(String),

    #[error("MCP server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("MCP error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("invalid MCP response: {0}")]
    Decode(String),

    #[error("no JSON-RPC response found in SSE stream")]
    EmptyStream,

    #[error("{0}")]
    Unsupported(String),

    #[error("provider not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl From<reqwest::Error> for McpError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => McpError::Status {
                status: status.as_u16(),
                body: e.to_string(),
            },
            None => McpError::Transport(e.to_string()),
        }
    }
}

impl From<McpError> for BrokerError {
    fn from(e: McpError) -> Self {
        match e {
            McpError::Broker(inner) => inner,
            McpError::NotFound(name) => BrokerError::not_found(format!("provider {}", name)),
            McpError::Unsupported(msg) => BrokerError::validation(msg),
            McpError::Status { status, body } => BrokerError::provider(status, body),
            other => BrokerError::transport(other),
        }
    }
}

/// Shared reqwest client for tool providers. Tool calls are not retried.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(TOOL_TIMEOUT)
        .connect_timeout(std::time::Duration::from_secs(5))
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("falling back to default HTTP client: {}", e);
            reqwest::Client::new()
        })
}

/// Decode a 2xx JSON body or surface the upstream status and body.
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, McpError> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(McpError::Status {
            status: status.as_u16(),
            body,
        });
    }
    serde_json::from_str(&body).map_err(|e| McpError::Decode(format!("{} (body: {})", e, crate::cloud::http::truncate(&body, 200))))
}
