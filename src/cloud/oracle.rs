use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest_middleware::ClientWithMiddleware;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use serde::Deserialize;

use super::http::{build_client, read_json, IAM_TIMEOUT};
use super::oci_signing::{key_id, parse_private_key, sign_request};
use super::types::{CredentialConfig, EphemeralCredential, OracleCredentialConfig, OracleSessionToken, ProviderType};
use super::CloudAdapter;
use crate::errors::{BrokerError, Result};

pub const DEFAULT_REGION: &str = "us-ashburn-1";
pub const DEFAULT_PROFILE: &str = "DEFAULT";
pub const MIN_SESSION_MINUTES: u32 = 5;
pub const MAX_SESSION_MINUTES: u32 = 60;
const EPHEMERAL_KEY_BITS: usize = 2048;

#[derive(Deserialize)]
struct SessionResponse {
    token: String,
}

/// OCI session tokens bound to a fresh ephemeral key pair. The user's API
/// signing key only signs the session request.
pub struct OracleAdapter {
    client: ClientWithMiddleware,
    /// Overrides `https://auth.{region}.oraclecloud.com`.
    endpoint: Option<String>,
}

impl Default for OracleAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl OracleAdapter {
    pub fn new() -> Self {
        Self {
            client: build_client(IAM_TIMEOUT),
            endpoint: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into().trim_end_matches('/').to_string());
        self
    }

    fn session_url(&self, region: &str) -> String {
        let base = match &self.endpoint {
            Some(e) => e.clone(),
            None => format!("https://auth.{}.oraclecloud.com", region),
        };
        format!("{}/v1/authentication/generateScopedAccessToken", base)
    }

    pub async fn session_token(&self, config: &OracleCredentialConfig, sandbox_id: &str) -> Result<OracleSessionToken> {
        validate_config(config)?;
        let user_key = parse_private_key(&config.private_key_pem)?;
        let minutes = clamp_ttl(config.session_ttl_minutes);
        let region = if config.region.is_empty() { DEFAULT_REGION } else { config.region.as_str() };

        let ephemeral = tokio::task::spawn_blocking(|| {
            let mut rng = rand::thread_rng();
            RsaPrivateKey::new(&mut rng, EPHEMERAL_KEY_BITS)
        })
        .await
        .map_err(|e| BrokerError::Internal(anyhow::anyhow!("key generation task failed: {}", e)))?
        .map_err(|e| BrokerError::Internal(anyhow::anyhow!("ephemeral key generation failed: {}", e)))?;

        let public_pem = ephemeral
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("encode public key: {}", e)))?;
        let body = serde_json::to_vec(&serde_json::json!({
            "publicKey": public_pem,
            "sessionExpirationInMins": minutes,
        }))
        .map_err(|e| BrokerError::Internal(e.into()))?;

        let url = self.session_url(region);
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        sign_request(
            "POST",
            &url,
            &mut headers,
            &body,
            &key_id(&config.tenancy_ocid, &config.user_ocid, &config.fingerprint),
            &user_key,
            Utc::now(),
        )?;

        tracing::debug!(sandbox_id = %sandbox_id, region = %region, minutes, "requesting OCI session token");
        let resp = self.client.post(&url).headers(headers).body(body).send().await?;
        let session: SessionResponse = read_json(resp).await?;

        let private_key = ephemeral
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("encode ephemeral key: {}", e)))?;

        Ok(OracleSessionToken {
            token: session.token,
            private_key: private_key.to_string(),
            region: region.to_string(),
            expires_at: Utc::now() + Duration::minutes(i64::from(minutes)),
        })
    }
}

#[async_trait]
impl CloudAdapter for OracleAdapter {
    fn provider(&self) -> ProviderType {
        ProviderType::Oracle
    }

    fn validate(&self, config: &CredentialConfig) -> Result<()> {
        match config {
            CredentialConfig::Oracle(c) => {
                validate_config(c)?;
                parse_private_key(&c.private_key_pem).map(|_| ())
            }
            _ => Err(BrokerError::validation("expected Oracle Cloud configuration")),
        }
    }

    async fn exchange(&self, config: &CredentialConfig, sandbox_id: &str) -> Result<EphemeralCredential> {
        match config {
            CredentialConfig::Oracle(c) => Ok(EphemeralCredential::Oracle(self.session_token(c, sandbox_id).await?)),
            _ => Err(BrokerError::validation("expected Oracle Cloud configuration")),
        }
    }
}

pub fn validate_config(config: &OracleCredentialConfig) -> Result<()> {
    if config.tenancy_ocid.is_empty() || config.user_ocid.is_empty() || config.fingerprint.is_empty() {
        return Err(BrokerError::validation("tenancyOcid, userOcid, and fingerprint are required"));
    }
    if config.private_key_pem.is_empty() {
        return Err(BrokerError::validation("privateKeyPem is required"));
    }
    Ok(())
}

/// Requested TTL when within [5, 60] minutes, otherwise 60.
pub fn clamp_ttl(requested: Option<u32>) -> u32 {
    match requested {
        Some(m) if (MIN_SESSION_MINUTES..=MAX_SESSION_MINUTES).contains(&m) => m,
        _ => MAX_SESSION_MINUTES,
    }
}

/// `~/.oci/config` stanza for session-token authentication.
pub fn oci_config(profile: &str, region: &str, tenancy_ocid: &str) -> String {
    let profile = if profile.is_empty() { DEFAULT_PROFILE } else { profile };
    format!(
        "[{profile}]\n\
         tenancy={tenancy}\n\
         region={region}\n\
         security_token_file=~/.oci/sessions/{profile}/token\n\
         key_file=~/.oci/sessions/{profile}/oci_api_key.pem\n",
        profile = profile,
        tenancy = tenancy_ocid,
        region = region,
    )
}
