use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest_middleware::ClientWithMiddleware;

use super::http::{build_client, truncate, IAM_TIMEOUT};
use super::sigv4::{sign_request, SigningCredentials};
use super::types::{AwsCredentialConfig, AwsTemporaryCredentials, CredentialConfig, EphemeralCredential, ProviderType};
use super::CloudAdapter;
use crate::errors::{BrokerError, Result};

pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_SESSION_SECS: u64 = 3600;
pub const MIN_SESSION_SECS: u64 = 15 * 60;
pub const MAX_SESSION_SECS: u64 = 12 * 3600;
const STS_VERSION: &str = "2011-06-15";
const SESSION_NAME_PREFIX: &str = "broker";

static ROLE_ARN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^arn:aws[a-z-]*:iam::\d{12}:role/[\w+=,.@/-]{1,128}$").expect("valid regex"));
static ACCOUNT_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{12}$").expect("valid regex"));

/// STS-backed exchange: AssumeRole when a role is configured, otherwise
/// GetSessionToken with the user's own keys.
pub struct AwsAdapter {
    client: ClientWithMiddleware,
    default_access_key_id: Option<String>,
    default_secret_access_key: Option<String>,
    /// Overrides `https://sts.{region}.amazonaws.com`.
    endpoint: Option<String>,
}

impl AwsAdapter {
    pub fn new(default_credentials: Option<(String, String)>) -> Self {
        let (ak, sk) = match default_credentials {
            Some((ak, sk)) => (Some(ak), Some(sk)),
            None => (None, None),
        };
        Self {
            client: build_client(IAM_TIMEOUT),
            default_access_key_id: ak,
            default_secret_access_key: sk,
            endpoint: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    fn sts_url(&self, region: &str) -> String {
        match &self.endpoint {
            Some(e) => e.trim_end_matches('/').to_string() + "/",
            None => format!("https://sts.{}.amazonaws.com/", region),
        }
    }

    /// Keys used to sign the STS call: the user's if present, else backend defaults.
    fn source_keys<'a>(&'a self, config: &'a AwsCredentialConfig) -> Option<(&'a str, &'a str)> {
        if !config.access_key_id.is_empty() && !config.secret_access_key.is_empty() {
            return Some((&config.access_key_id, &config.secret_access_key));
        }
        match (&self.default_access_key_id, &self.default_secret_access_key) {
            (Some(ak), Some(sk)) => Some((ak.as_str(), sk.as_str())),
            _ => None,
        }
    }

    pub async fn credentials_for_sandbox(
        &self,
        config: &AwsCredentialConfig,
        sandbox_id: &str,
    ) -> Result<AwsTemporaryCredentials> {
        let session = session_name(sandbox_id);
        if config.role_arn.is_empty() {
            self.get_session_token(config).await
        } else {
            self.assume_role(config, &session).await
        }
    }

    pub async fn assume_role(
        &self,
        config: &AwsCredentialConfig,
        session_name: &str,
    ) -> Result<AwsTemporaryCredentials> {
        let duration = clamp_duration(config.session_duration_secs);
        let mut params = vec![
            ("Action", "AssumeRole".to_string()),
            ("Version", STS_VERSION.to_string()),
            ("RoleArn", config.role_arn.clone()),
            ("RoleSessionName", session_name.to_string()),
            ("DurationSeconds", duration.to_string()),
        ];
        if !config.external_id.is_empty() {
            params.push(("ExternalId", config.external_id.clone()));
        }

        tracing::debug!(role_arn = %config.role_arn, session = %session_name, duration, "sts AssumeRole");
        let body = self.call_sts(config, &params).await?;
        parse_credentials(&body)
    }

    pub async fn get_session_token(&self, config: &AwsCredentialConfig) -> Result<AwsTemporaryCredentials> {
        if config.access_key_id.is_empty() && self.default_access_key_id.is_none() {
            return Err(BrokerError::config(
                "access key credentials are required to get session token",
            ));
        }
        let duration = clamp_duration(config.session_duration_secs);
        let params = vec![
            ("Action", "GetSessionToken".to_string()),
            ("Version", STS_VERSION.to_string()),
            ("DurationSeconds", duration.to_string()),
        ];
        let body = self.call_sts(config, &params).await?;
        parse_credentials(&body)
    }

    /// ARN of the identity the configured keys resolve to.
    pub async fn caller_identity(&self, config: &AwsCredentialConfig) -> Result<String> {
        let params = vec![
            ("Action", "GetCallerIdentity".to_string()),
            ("Version", STS_VERSION.to_string()),
        ];
        let body = self.call_sts(config, &params).await?;
        xml_text(&body, "Arn").ok_or_else(|| BrokerError::provider(200, "STS response missing Arn"))
    }

    async fn call_sts(&self, config: &AwsCredentialConfig, params: &[(&str, String)]) -> Result<String> {
        let (ak, sk) = self
            .source_keys(config)
            .ok_or_else(|| BrokerError::config("no AWS source credentials configured"))?;
        let region = if config.region.is_empty() { DEFAULT_REGION } else { config.region.as_str() };
        let url = self.sts_url(region);

        let body = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded; charset=utf-8"),
        );
        let creds = SigningCredentials {
            access_key_id: ak,
            secret_access_key: sk,
            session_token: None,
        };
        sign_request("POST", &url, &mut headers, body.as_bytes(), &creds, region, "sts", Utc::now())?;

        let resp = self.client.post(&url).headers(headers).body(body).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            let code = xml_text(&text, "Code").unwrap_or_default();
            let message = xml_text(&text, "Message").unwrap_or_else(|| truncate(&text, 256).to_string());
            tracing::warn!(status = status.as_u16(), code = %code, "sts call rejected");
            return Err(BrokerError::provider(status.as_u16(), format!("{}: {}", code, message)));
        }
        Ok(text)
    }
}

#[async_trait]
impl CloudAdapter for AwsAdapter {
    fn provider(&self) -> ProviderType {
        ProviderType::Aws
    }

    fn validate(&self, config: &CredentialConfig) -> Result<()> {
        match config {
            CredentialConfig::Aws(c) => validate_config(c),
            _ => Err(BrokerError::validation("expected AWS configuration")),
        }
    }

    async fn exchange(&self, config: &CredentialConfig, sandbox_id: &str) -> Result<EphemeralCredential> {
        match config {
            CredentialConfig::Aws(c) => Ok(EphemeralCredential::Aws(self.credentials_for_sandbox(c, sandbox_id).await?)),
            _ => Err(BrokerError::validation("expected AWS configuration")),
        }
    }
}

/// `<prefix>-<sandboxID>`, at most 64 characters.
pub fn session_name(sandbox_id: &str) -> String {
    let mut name = format!("{}-{}", SESSION_NAME_PREFIX, sandbox_id);
    if name.len() > 64 {
        let mut cut = 64;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
    name
}

/// Requested duration defaulted to 1h and clamped to [15m, 12h].
pub fn clamp_duration(requested: Option<u64>) -> u64 {
    match requested {
        None | Some(0) => DEFAULT_SESSION_SECS,
        Some(d) => d.clamp(MIN_SESSION_SECS, MAX_SESSION_SECS),
    }
}

pub fn validate_role_arn(arn: &str) -> bool {
    ROLE_ARN.is_match(arn)
}

pub fn validate_config(config: &AwsCredentialConfig) -> Result<()> {
    if !config.role_arn.is_empty() && !validate_role_arn(&config.role_arn) {
        return Err(BrokerError::validation(format!("invalid role ARN: {}", config.role_arn)));
    }
    let has_keys = !config.access_key_id.is_empty() || !config.secret_access_key.is_empty();
    if has_keys && (config.access_key_id.is_empty() || config.secret_access_key.is_empty()) {
        return Err(BrokerError::validation(
            "accessKeyId and secretAccessKey must be provided together",
        ));
    }
    if config.role_arn.is_empty() {
        if !has_keys {
            return Err(BrokerError::validation("roleArn or access keys are required"));
        }
        if config.account_id.is_empty() {
            return Err(BrokerError::validation("accountId is required when using access keys without a role"));
        }
    }
    if !config.account_id.is_empty() && !ACCOUNT_ID.is_match(&config.account_id) {
        return Err(BrokerError::validation("accountId must be 12 digits"));
    }
    Ok(())
}

fn parse_credentials(body: &str) -> Result<AwsTemporaryCredentials> {
    let field = |tag: &str| {
        xml_text(body, tag)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| BrokerError::provider(200, format!("no {} returned from STS", tag)))
    };
    let expiration = field("Expiration")?;
    let expiration = DateTime::parse_from_rfc3339(&expiration)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| BrokerError::provider(200, format!("bad Expiration '{}': {}", expiration, e)))?;

    Ok(AwsTemporaryCredentials {
        version: 1,
        access_key_id: field("AccessKeyId")?,
        secret_access_key: field("SecretAccessKey")?,
        session_token: field("SessionToken")?,
        expiration,
    })
}

/// Text of the first `<tag>…</tag>` element, entity-decoded.
fn xml_text(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(
        body[start..end]
            .trim()
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&apos;", "'")
            .replace("&amp;", "&"),
    )
}
