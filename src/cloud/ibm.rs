use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;

use super::http::{build_client, read_json, IAM_TIMEOUT};
use super::types::{AccessToken, CredentialConfig, EphemeralCredential, IbmCredentialConfig, ProviderType};
use super::CloudAdapter;
use crate::errors::{BrokerError, Result};

pub const IAM_TOKEN_URL: &str = "https://iam.cloud.ibm.com/identity/token";
const APIKEY_GRANT: &str = "urn:ibm:params:oauth:grant-type:apikey";

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: i64,
    /// Unix seconds.
    #[serde(default)]
    expiration: i64,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_token(self) -> AccessToken {
        let expires_at = Utc
            .timestamp_opt(self.expiration, 0)
            .single()
            .filter(|_| self.expiration > 0)
            .unwrap_or_else(|| Utc::now() + Duration::seconds(self.expires_in.max(0)));
        AccessToken {
            access_token: self.access_token,
            token_type: self.token_type.unwrap_or_else(|| "Bearer".into()),
            expires_in: self.expires_in,
            expires_at,
            refresh_token: self.refresh_token,
            scope: self.scope,
        }
    }
}

/// IBM Cloud IAM: API key in, ~60 minute IAM token out.
pub struct IbmAdapter {
    client: ClientWithMiddleware,
    token_url: String,
}

impl Default for IbmAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl IbmAdapter {
    pub fn new() -> Self {
        Self {
            client: build_client(IAM_TIMEOUT),
            token_url: IAM_TOKEN_URL.to_string(),
        }
    }

    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    pub async fn access_token(&self, config: &IbmCredentialConfig) -> Result<AccessToken> {
        if config.api_key.is_empty() {
            return Err(BrokerError::validation("apiKey is required"));
        }
        let resp = self
            .client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&[("grant_type", APIKEY_GRANT), ("apikey", config.api_key.as_str())])
            .send()
            .await?;
        let token: TokenResponse = read_json(resp).await?;
        Ok(token.into_token())
    }

    /// Fallback for callers that kept only the refresh token. Re-exchanging
    /// the API key is preferred whenever it is still stored.
    pub async fn refresh(&self, refresh_token: &str) -> Result<AccessToken> {
        if refresh_token.is_empty() {
            return Err(BrokerError::config("no refresh token available"));
        }
        let resp = self
            .client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .basic_auth("bx", Some("bx"))
            .form(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
            .send()
            .await?;
        let token: TokenResponse = read_json(resp).await?;
        Ok(token.into_token())
    }
}

#[async_trait]
impl CloudAdapter for IbmAdapter {
    fn provider(&self) -> ProviderType {
        ProviderType::Ibm
    }

    fn validate(&self, config: &CredentialConfig) -> Result<()> {
        match config {
            CredentialConfig::Ibm(c) if c.api_key.is_empty() => Err(BrokerError::validation("apiKey is required")),
            CredentialConfig::Ibm(_) => Ok(()),
            _ => Err(BrokerError::validation("expected IBM Cloud configuration")),
        }
    }

    async fn exchange(&self, config: &CredentialConfig, sandbox_id: &str) -> Result<EphemeralCredential> {
        match config {
            CredentialConfig::Ibm(c) => {
                tracing::debug!(sandbox_id = %sandbox_id, "ibm apikey exchange");
                Ok(EphemeralCredential::Ibm(self.access_token(c).await?))
            }
            _ => Err(BrokerError::validation("expected IBM Cloud configuration")),
        }
    }
}

/// Environment for the `ibmcloud` CLI and Terraform provider. The API key is
/// never part of it.
pub fn env_config(token: &AccessToken, config: &IbmCredentialConfig) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("IBMCLOUD_IAM_TOKEN".into(), format!("Bearer {}", token.access_token));
    env.insert("IC_IAM_TOKEN".into(), token.access_token.clone());
    if !config.region.is_empty() {
        env.insert("IBMCLOUD_REGION".into(), config.region.clone());
    }
    if !config.account_id.is_empty() {
        env.insert("IBMCLOUD_ACCOUNT_ID".into(), config.account_id.clone());
    }
    if !config.resource_group.is_empty() {
        env.insert("IBMCLOUD_RESOURCE_GROUP".into(), config.resource_group.clone());
    }
    env
}
