//! OAuth2-backed tool connections and the lazy refresh cache in front of them.

pub mod oauth2;
pub mod store;
pub mod tokens;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use oauth2::{parse_token_response, GenericOAuth2Handler, OAuth2Handler, OAuth2HandlerConfig};
pub use store::{IntegrationBackend, IntegrationStore, MemoryIntegrations, SqliteIntegrations};
pub use tokens::{IntegrationTokenSource, TokenCache, REFRESH_BUFFER_SECS};

/// Stored OAuth2 credentials. Never serialized into API responses.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OAuth2Token {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub refresh_token: String,
    #[serde(default)]
    pub token_type: String,
    /// `None` means the upstream gave no expiry; the token is used as-is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

/// A user's connection to one integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIntegration {
    pub user_id: String,
    pub integration_id: String,
    pub enabled: bool,
    pub connected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account_id: String,
    #[serde(skip)]
    pub oauth2_token: Option<OAuth2Token>,
}

impl UserIntegration {
    pub fn new(user_id: &str, integration_id: &str, token: OAuth2Token) -> Self {
        Self {
            user_id: user_id.to_string(),
            integration_id: integration_id.to_string(),
            enabled: true,
            connected_at: Utc::now(),
            account_name: String::new(),
            account_id: String::new(),
            oauth2_token: Some(token),
        }
    }
}
