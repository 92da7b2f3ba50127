use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};

use super::http::{build_client, read_json, IAM_TIMEOUT};
use super::types::{AccessToken, CredentialConfig, EphemeralCredential, GcpCredentialConfig, ProviderType};
use super::CloudAdapter;
use crate::errors::{BrokerError, Result};

pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
pub const STS_ENDPOINT: &str = "https://sts.googleapis.com/v1/token";
pub const IAM_CREDENTIALS_API: &str = "https://iamcredentials.googleapis.com/v1";
pub const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const TOKEN_LIFETIME_SECS: i64 = 3600;
const SA_DOMAIN_SUFFIX: &str = ".iam.gserviceaccount.com";

/// Fields of a service-account key file the broker needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type", default)]
    pub key_type: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub private_key_id: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub client_email: String,
    #[serde(default)]
    pub token_uri: String,
}

impl ServiceAccountKey {
    pub fn parse(json: &str) -> Result<Self> {
        if json.trim().is_empty() {
            return Err(BrokerError::validation("service account JSON is required"));
        }
        let key: ServiceAccountKey = serde_json::from_str(json)
            .map_err(|e| BrokerError::validation(format!("failed to parse service account JSON: {}", e)))?;
        if key.key_type != "service_account" {
            return Err(BrokerError::validation(format!(
                "expected service_account key, got '{}'",
                key.key_type
            )));
        }
        if key.client_email.is_empty() || key.private_key.is_empty() {
            return Err(BrokerError::validation(
                "service account JSON must contain client_email and private_key",
            ));
        }
        Ok(key)
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: String,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAccessTokenResponse {
    access_token: String,
    expire_time: String,
}

/// Service-account and impersonation token minting, plus STS federation.
pub struct GcpAdapter {
    client: ClientWithMiddleware,
    iam_credentials_api: String,
    sts_endpoint: String,
}

impl Default for GcpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl GcpAdapter {
    pub fn new() -> Self {
        Self {
            client: build_client(IAM_TIMEOUT),
            iam_credentials_api: IAM_CREDENTIALS_API.to_string(),
            sts_endpoint: STS_ENDPOINT.to_string(),
        }
    }

    pub fn with_iam_credentials_api(mut self, base: impl Into<String>) -> Self {
        self.iam_credentials_api = base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_sts_endpoint(mut self, url: impl Into<String>) -> Self {
        self.sts_endpoint = url.into();
        self
    }

    pub async fn access_token_for_sandbox(&self, config: &GcpCredentialConfig, sandbox_id: &str) -> Result<AccessToken> {
        if config.impersonate_service_account.is_empty() {
            tracing::debug!(sandbox_id = %sandbox_id, "minting GCP token from service account");
            self.token_from_service_account(config).await
        } else {
            tracing::debug!(
                sandbox_id = %sandbox_id,
                target = %config.impersonate_service_account,
                "minting GCP token via impersonation"
            );
            self.token_via_impersonation(config).await
        }
    }

    /// JWT-bearer grant signed with the key's RSA private key.
    pub async fn token_from_service_account(&self, config: &GcpCredentialConfig) -> Result<AccessToken> {
        let key = ServiceAccountKey::parse(&config.service_account_json)?;
        let token_uri = if key.token_uri.is_empty() { TOKEN_ENDPOINT } else { key.token_uri.as_str() };

        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &key.client_email,
            scope: scopes(config).join(" "),
            aud: token_uri,
            iat: now,
            exp: now + TOKEN_LIFETIME_SECS,
        };
        let mut header = Header::new(Algorithm::RS256);
        if !key.private_key_id.is_empty() {
            header.kid = Some(key.private_key_id.clone());
        }
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| BrokerError::validation(format!("invalid service account private key: {}", e)))?;
        let assertion = encode(&header, &claims, &signing_key)
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("assertion signing failed: {}", e)))?;

        let resp = self
            .client
            .post(token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;
        let token: OAuthTokenResponse = read_json(resp).await?;
        let expires_in = token.expires_in.unwrap_or(TOKEN_LIFETIME_SECS);

        Ok(AccessToken {
            access_token: token.access_token,
            token_type: token.token_type.unwrap_or_else(|| "Bearer".into()),
            expires_in,
            expires_at: Utc::now() + Duration::seconds(expires_in),
            refresh_token: None,
            scope: None,
        })
    }

    /// Mint a source token, then `generateAccessToken` for the target account.
    pub async fn token_via_impersonation(&self, config: &GcpCredentialConfig) -> Result<AccessToken> {
        let source = self.token_from_service_account(config).await?;

        let project = if config.project_id.is_empty() {
            ServiceAccountKey::parse(&config.service_account_json)?.project_id
        } else {
            config.project_id.clone()
        };
        let target = qualify_service_account(&config.impersonate_service_account, &project);
        let url = format!(
            "{}/projects/-/serviceAccounts/{}:generateAccessToken",
            self.iam_credentials_api, target
        );

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&source.access_token)
            .json(&serde_json::json!({
                "scope": scopes(config),
                "lifetime": format!("{}s", TOKEN_LIFETIME_SECS),
            }))
            .send()
            .await?;
        let result: GenerateAccessTokenResponse = read_json(resp).await?;
        let expires_at = DateTime::parse_from_rfc3339(&result.expire_time)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| BrokerError::provider(200, format!("bad expireTime '{}': {}", result.expire_time, e)))?;

        Ok(AccessToken::bearer(result.access_token, expires_at))
    }

    /// RFC 8693 token exchange of a foreign JWT for a federated access token.
    pub async fn exchange_subject_token(
        &self,
        subject_token: &str,
        audience: &str,
        scope: &[String],
    ) -> Result<AccessToken> {
        let scope = if scope.is_empty() { DEFAULT_SCOPE.to_string() } else { scope.join(" ") };
        let mut form = vec![
            ("grant_type", "urn:ietf:params:oauth:grant-type:token-exchange"),
            ("subject_token_type", "urn:ietf:params:oauth:token-type:jwt"),
            ("subject_token", subject_token),
            ("requested_token_type", "urn:ietf:params:oauth:token-type:access_token"),
            ("scope", scope.as_str()),
        ];
        if !audience.is_empty() {
            form.push(("audience", audience));
        }

        let resp = self.client.post(&self.sts_endpoint).form(&form).send().await?;
        let token: OAuthTokenResponse = read_json(resp).await?;
        let expires_in = token.expires_in.unwrap_or(TOKEN_LIFETIME_SECS);
        Ok(AccessToken {
            access_token: token.access_token,
            token_type: token.token_type.unwrap_or_else(|| "Bearer".into()),
            expires_in,
            expires_at: Utc::now() + Duration::seconds(expires_in),
            refresh_token: None,
            scope: Some(scope),
        })
    }
}

#[async_trait]
impl CloudAdapter for GcpAdapter {
    fn provider(&self) -> ProviderType {
        ProviderType::Gcp
    }

    fn validate(&self, config: &CredentialConfig) -> Result<()> {
        match config {
            CredentialConfig::Gcp(c) => ServiceAccountKey::parse(&c.service_account_json).map(|_| ()),
            _ => Err(BrokerError::validation("expected GCP configuration")),
        }
    }

    async fn exchange(&self, config: &CredentialConfig, sandbox_id: &str) -> Result<EphemeralCredential> {
        match config {
            CredentialConfig::Gcp(c) => Ok(EphemeralCredential::Gcp(self.access_token_for_sandbox(c, sandbox_id).await?)),
            _ => Err(BrokerError::validation("expected GCP configuration")),
        }
    }
}

fn scopes(config: &GcpCredentialConfig) -> Vec<String> {
    if config.scopes.is_empty() {
        vec![DEFAULT_SCOPE.to_string()]
    } else {
        config.scopes.clone()
    }
}

/// `name` → `name@project.iam.gserviceaccount.com`; `name@project` gains the
/// domain suffix; full addresses are unchanged.
pub fn qualify_service_account(account: &str, project: &str) -> String {
    if account.ends_with(SA_DOMAIN_SUFFIX) || account.ends_with(".gserviceaccount.com") {
        return account.to_string();
    }
    if account.contains('@') {
        return format!("{}{}", account, SA_DOMAIN_SUFFIX);
    }
    format!("{}@{}{}", account, project, SA_DOMAIN_SUFFIX)
}
