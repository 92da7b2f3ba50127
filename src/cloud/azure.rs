use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;

use super::http::{build_client, read_json, IAM_TIMEOUT};
use super::types::{AccessToken, AzureCredentialConfig, CredentialConfig, EphemeralCredential, ProviderType};
use super::CloudAdapter;
use crate::errors::{BrokerError, Result};

pub const AUTHORITY: &str = "https://login.microsoftonline.com";
pub const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Azure AD client-credentials grant for a service principal.
pub struct AzureAdapter {
    client: ClientWithMiddleware,
    authority: String,
}

impl Default for AzureAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl AzureAdapter {
    pub fn new() -> Self {
        Self {
            client: build_client(IAM_TIMEOUT),
            authority: AUTHORITY.to_string(),
        }
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into().trim_end_matches('/').to_string();
        self
    }

    pub async fn access_token(&self, config: &AzureCredentialConfig) -> Result<AccessToken> {
        validate_config(config)?;
        if config.client_secret.is_empty() {
            return Err(BrokerError::config(
                "certificate-based service principals cannot be exchanged; store a client secret",
            ));
        }

        let url = format!("{}/{}/oauth2/v2.0/token", self.authority, config.tenant_id);
        let resp = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", config.client_id.as_str()),
                ("client_secret", config.client_secret.as_str()),
                ("scope", MANAGEMENT_SCOPE),
            ])
            .send()
            .await?;
        let token: TokenResponse = read_json(resp).await?;
        let expires_in = token.expires_in.unwrap_or(3600);

        Ok(AccessToken {
            access_token: token.access_token,
            token_type: token.token_type.unwrap_or_else(|| "Bearer".into()),
            expires_in,
            expires_at: Utc::now() + Duration::seconds(expires_in),
            refresh_token: None,
            scope: Some(MANAGEMENT_SCOPE.to_string()),
        })
    }
}

#[async_trait]
impl CloudAdapter for AzureAdapter {
    fn provider(&self) -> ProviderType {
        ProviderType::Azure
    }

    fn validate(&self, config: &CredentialConfig) -> Result<()> {
        match config {
            CredentialConfig::Azure(c) => validate_config(c),
            _ => Err(BrokerError::validation("expected Azure configuration")),
        }
    }

    async fn exchange(&self, config: &CredentialConfig, sandbox_id: &str) -> Result<EphemeralCredential> {
        match config {
            CredentialConfig::Azure(c) => {
                tracing::debug!(sandbox_id = %sandbox_id, tenant_id = %c.tenant_id, "azure client-credentials grant");
                Ok(EphemeralCredential::Azure(self.access_token(c).await?))
            }
            _ => Err(BrokerError::validation("expected Azure configuration")),
        }
    }
}

pub fn validate_config(config: &AzureCredentialConfig) -> Result<()> {
    if config.tenant_id.is_empty() || config.client_id.is_empty() {
        return Err(BrokerError::validation("tenantId and clientId are required"));
    }
    if config.client_secret.is_empty() && config.certificate_pem.is_empty() {
        return Err(BrokerError::validation("clientSecret or certificatePem is required"));
    }
    Ok(())
}

/// Environment for the `az` CLI and SDKs. Holds the access token only.
pub fn env_config(token: &AccessToken, config: &AzureCredentialConfig) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("AZURE_TENANT_ID".into(), config.tenant_id.clone());
    env.insert("AZURE_CLIENT_ID".into(), config.client_id.clone());
    if !config.subscription_id.is_empty() {
        env.insert("AZURE_SUBSCRIPTION_ID".into(), config.subscription_id.clone());
    }
    env.insert("AZURE_ACCESS_TOKEN".into(), token.access_token.clone());
    env
}
