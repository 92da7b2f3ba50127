use serde::Deserialize;

const PLACEHOLDER_JWT_SECRET: &str = "CHANGE_ME_SESSION_TOKEN_SECRET";
const PLACEHOLDER_ENCRYPTION_KEY: &str = "CHANGE_ME_CREDENTIAL_ENCRYPTION_KEY";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    /// Public URL the sandbox helpers call back to.
    pub backend_url: String,
    pub jwt_secret: String,
    pub encryption_key: String,
    /// Operator key guarding non-sandbox endpoints. Falls back to jwt_secret.
    pub admin_key: Option<String>,
    pub session_token_ttl_secs: u64,
    pub session_token_max_ttl_secs: u64,
    /// `sqlite://...` enables the durable credential store.
    pub database_url: Option<String>,

    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_region: String,
    /// Workload-identity provider audience for the GCP `external_account` helper.
    pub gcp_workload_audience: Option<String>,

    pub mcp_provider: String,
    pub pipedream: Option<PipedreamSettings>,
    pub composio_api_key: Option<String>,
    pub direct_mcp_url: Option<String>,
    pub direct_mcp_token: Option<String>,
    /// Integration whose per-user OAuth2 token authenticates the direct provider.
    pub direct_mcp_integration: Option<String>,
    /// OAuth2 apps users can connect, from `OAUTH2_INTEGRATIONS` (JSON array).
    pub oauth2_integrations: Vec<OAuth2IntegrationSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuth2IntegrationSettings {
    pub id: String,
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    #[serde(default)]
    pub redirect_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipedreamSettings {
    pub client_id: String,
    pub client_secret: String,
    pub project_id: String,
    pub environment: String,
}

impl Config {
    pub fn admin_key(&self) -> &str {
        self.admin_key.as_deref().unwrap_or(&self.jwt_secret)
    }

    pub fn aws_default_credentials(&self) -> Option<(String, String)> {
        match (&self.aws_access_key_id, &self.aws_secret_access_key) {
            (Some(ak), Some(sk)) if !ak.is_empty() && !sk.is_empty() => Some((ak.clone(), sk.clone())),
            _ => None,
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn check_placeholder(name: &str, value: &str, placeholder: &str) -> anyhow::Result<()> {
    if value != placeholder {
        return Ok(());
    }
    let env_mode = std::env::var("BROKER_ENV")
        .or_else(|_| std::env::var("RUST_ENV"))
        .unwrap_or_default();
    if env_mode == "production" {
        anyhow::bail!(
            "{} is still the insecure placeholder. Set a real secret before running in production.",
            name
        );
    }
    tracing::warn!("{} is not set, using insecure placeholder", name);
    Ok(())
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_else(|_| PLACEHOLDER_JWT_SECRET.into());
    check_placeholder("JWT_SECRET", &jwt_secret, PLACEHOLDER_JWT_SECRET)?;

    let encryption_key =
        std::env::var("ENCRYPTION_KEY").unwrap_or_else(|_| PLACEHOLDER_ENCRYPTION_KEY.into());
    check_placeholder("ENCRYPTION_KEY", &encryption_key, PLACEHOLDER_ENCRYPTION_KEY)?;

    let port: u16 = env_parse("PORT", 8080);

    let pipedream = match (
        env_opt("PIPEDREAM_CLIENT_ID"),
        env_opt("PIPEDREAM_CLIENT_SECRET"),
        env_opt("PIPEDREAM_PROJECT_ID"),
    ) {
        (Some(client_id), Some(client_secret), Some(project_id)) => Some(PipedreamSettings {
            client_id,
            client_secret,
            project_id,
            environment: env_opt("PIPEDREAM_ENVIRONMENT").unwrap_or_else(|| "development".into()),
        }),
        _ => None,
    };

    let oauth2_integrations = match env_opt("OAUTH2_INTEGRATIONS") {
        Some(raw) => parse_integrations(&raw)?,
        None => Vec::new(),
    };

    Ok(Config {
        port,
        backend_url: env_opt("BACKEND_URL").unwrap_or_else(|| format!("http://localhost:{}", port)),
        jwt_secret,
        encryption_key,
        admin_key: env_opt("BROKER_ADMIN_KEY"),
        session_token_ttl_secs: env_parse("SESSION_TOKEN_TTL_SECS", 300),
        session_token_max_ttl_secs: env_parse("SESSION_TOKEN_MAX_TTL_SECS", 3600),
        database_url: env_opt("DATABASE_URL"),
        aws_access_key_id: env_opt("AWS_ACCESS_KEY_ID"),
        aws_secret_access_key: env_opt("AWS_SECRET_ACCESS_KEY"),
        aws_region: env_opt("AWS_REGION").unwrap_or_else(|| "us-east-1".into()),
        gcp_workload_audience: env_opt("GCP_WORKLOAD_IDENTITY_AUDIENCE"),
        mcp_provider: env_opt("MCP_PROVIDER").unwrap_or_else(|| "pipedream".into()),
        pipedream,
        composio_api_key: env_opt("COMPOSIO_API_KEY"),
        direct_mcp_url: env_opt("MCP_DIRECT_URL"),
        direct_mcp_token: env_opt("MCP_DIRECT_TOKEN"),
        direct_mcp_integration: env_opt("MCP_DIRECT_INTEGRATION"),
        oauth2_integrations,
    })
}

fn parse_integrations(raw: &str) -> anyhow::Result<Vec<OAuth2IntegrationSettings>> {
    let parsed: Vec<OAuth2IntegrationSettings> =
        serde_json::from_str(raw).map_err(|e| anyhow::anyhow!("OAUTH2_INTEGRATIONS is not valid JSON: {}", e))?;
    if let Some(bad) = parsed.iter().find(|i| i.id.is_empty() || i.token_url.is_empty()) {
        anyhow::bail!("OAUTH2_INTEGRATIONS entry '{}' needs id and tokenUrl", bad.id);
    }
    Ok(parsed)
}

/// Minimal config for unit tests elsewhere in the crate.
#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        port: 8080,
        backend_url: "http://localhost:8080".into(),
        jwt_secret: "jwt".into(),
        encryption_key: "enc".into(),
        admin_key: None,
        session_token_ttl_secs: 300,
        session_token_max_ttl_secs: 3600,
        database_url: None,
        aws_access_key_id: None,
        aws_secret_access_key: None,
        aws_region: "us-east-1".into(),
        gcp_workload_audience: None,
        mcp_provider: "pipedream".into(),
        pipedream: None,
        composio_api_key: None,
        direct_mcp_url: None,
        direct_mcp_token: None,
        direct_mcp_integration: None,
        oauth2_integrations: Vec::new(),
    }
}
