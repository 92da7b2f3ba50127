use std::collections::HashMap;
use std::sync::Arc;

use crate::auth::TokenIssuer;
use crate::cloud::Manager;
use crate::config::Config;
use crate::errors::Result;
use crate::integrations::{GenericOAuth2Handler, IntegrationStore, OAuth2HandlerConfig, SqliteIntegrations, TokenCache};
use crate::mcp::direct::DirectProvider;
use crate::mcp::{ProviderConfig, ProviderKind, Registry};
use crate::vault::{CredentialStore, SqliteBackend};

/// Shared by every handler.
pub struct AppState {
    pub config: Config,
    pub issuer: Arc<TokenIssuer>,
    pub cloud: Manager,
    pub registry: Registry,
    pub integrations: Arc<TokenCache>,
}

impl AppState {
    pub fn new(config: Config, cloud: Manager, registry: Registry) -> Self {
        Self {
            issuer: cloud.issuer().clone(),
            config,
            cloud,
            registry,
            integrations: Arc::new(TokenCache::new()),
        }
    }

    /// Wire everything the config enables: the durable store when a
    /// database URL is set, and every tool provider whose credentials are
    /// present.
    pub async fn from_config(config: Config) -> Result<Self> {
        let (store, integration_store) = match &config.database_url {
            Some(url) => {
                let backend = SqliteBackend::connect(url).await?;
                backend.migrate().await?;
                let integrations = SqliteIntegrations::new(backend.pool().clone());
                integrations.migrate().await?;
                tracing::info!("credential store: sqlite");
                (
                    CredentialStore::new(&config.encryption_key, Arc::new(backend)),
                    IntegrationStore::new(&config.encryption_key, Arc::new(integrations)),
                )
            }
            None => {
                tracing::warn!("DATABASE_URL not set, credentials are kept in memory only");
                (
                    CredentialStore::in_memory(&config.encryption_key),
                    IntegrationStore::in_memory(&config.encryption_key),
                )
            }
        };

        let issuer = Arc::new(TokenIssuer::new(
            &config.jwt_secret,
            config.session_token_ttl_secs,
            config.session_token_max_ttl_secs,
        ));
        let cloud = Manager::new(
            store,
            issuer.clone(),
            config.backend_url.clone(),
            config.aws_default_credentials(),
        )
        .with_gcp_audience(config.gcp_workload_audience.clone());

        let integrations = Arc::new(integration_cache(&config, integration_store).await?);
        let registry = build_registry(&config, &integrations).await?;

        Ok(Self {
            config,
            issuer,
            cloud,
            registry,
            integrations,
        })
    }
}

/// Provider configs for every tool backend the environment enables.
pub fn provider_configs(config: &Config) -> Vec<ProviderConfig> {
    let mut out = Vec::new();

    if let Some(pd) = &config.pipedream {
        let mut cfg = ProviderConfig::new(ProviderKind::Pipedream, "pipedream");
        cfg.project_id = pd.project_id.clone();
        cfg.extra = HashMap::from([
            ("clientId".to_string(), pd.client_id.clone()),
            ("clientSecret".to_string(), pd.client_secret.clone()),
            ("environment".to_string(), pd.environment.clone()),
        ]);
        out.push(cfg);
    }

    if let Some(key) = &config.composio_api_key {
        let mut cfg = ProviderConfig::new(ProviderKind::Composio, "composio");
        cfg.api_key = key.clone();
        out.push(cfg);
    }

    if let Some(url) = &config.direct_mcp_url {
        let mut cfg = ProviderConfig::new(ProviderKind::Direct, "direct");
        cfg.base_url = url.clone();
        cfg.api_key = config.direct_mcp_token.clone().unwrap_or_default();
        out.push(cfg);
    }

    out
}

/// Token cache over `store` with a refresh handler for every configured
/// OAuth2 app.
pub async fn integration_cache(config: &Config, store: IntegrationStore) -> Result<TokenCache> {
    let cache = TokenCache::with_store(store).await?;
    for app in &config.oauth2_integrations {
        let handler = GenericOAuth2Handler::new(OAuth2HandlerConfig {
            client_id: app.client_id.clone(),
            client_secret: app.client_secret.clone(),
            auth_url: app.auth_url.clone(),
            token_url: app.token_url.clone(),
            redirect_url: app.redirect_url.clone(),
            scopes: app.scopes.clone(),
        });
        cache.register_handler(&app.id, Arc::new(handler));
        tracing::info!(integration = %app.id, "oauth2 integration registered");
    }
    Ok(cache)
}

pub async fn build_registry(config: &Config, integrations: &Arc<TokenCache>) -> Result<Registry> {
    let registry = Registry::new();
    for cfg in provider_configs(config) {
        match (&cfg.kind, &config.direct_mcp_integration) {
            // Per-user OAuth2 tokens replace the static bearer.
            (Some(ProviderKind::Direct), Some(integration)) => {
                let provider = DirectProvider::new(&cfg.registry_name(), &cfg.base_url, None)
                    .with_token_source(integrations.token_source(integration));
                registry.add_provider(cfg.registry_name(), Arc::new(provider)).await;
            }
            _ => {
                registry.create_provider(&cfg).await?;
            }
        }
    }

    if registry.set_default_provider(&config.mcp_provider).await.is_err() {
        // Fall back to whatever is registered first so unprefixed apps still route.
        match registry.provider_names().await.into_iter().next() {
            Some(first) => {
                tracing::warn!(
                    wanted = %config.mcp_provider,
                    using = %first,
                    "default tool provider not configured"
                );
                registry.set_default_provider(&first).await?;
            }
            None => tracing::warn!("no tool providers configured"),
        }
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{test_config, PipedreamSettings};

    fn config() -> Config {
        test_config()
    }

    #[test]
    fn test_absent_credentials_register_nothing() {
        assert!(provider_configs(&config()).is_empty());
    }

    #[tokio::test]
    async fn test_registry_defaults_to_configured_provider() {
        let mut cfg = config();
        cfg.pipedream = Some(PipedreamSettings {
            client_id: "id".into(),
            client_secret: "secret".into(),
            project_id: "proj_1".into(),
            environment: "development".into(),
        });
        cfg.composio_api_key = Some("ck".into());

        let registry = build_registry(&cfg, &Arc::new(TokenCache::new())).await.unwrap();
        assert_eq!(registry.provider_names().await, vec!["composio", "pipedream"]);
        assert_eq!(registry.default_provider().await.as_deref(), Some("pipedream"));
    }

    #[tokio::test]
    async fn test_missing_default_falls_back_to_first_registered() {
        let mut cfg = config();
        cfg.composio_api_key = Some("ck".into());
        let registry = build_registry(&cfg, &Arc::new(TokenCache::new())).await.unwrap();
        assert_eq!(registry.default_provider().await.as_deref(), Some("composio"));
    }

    #[tokio::test]
    async fn test_direct_provider_uses_integration_tokens() {
        let mut cfg = config();
        cfg.mcp_provider = "direct".into();
        cfg.direct_mcp_url = Some("http://mcp.internal/mcp".into());
        cfg.direct_mcp_integration = Some("github".into());
        cfg.oauth2_integrations = vec![crate::config::OAuth2IntegrationSettings {
            id: "github".into(),
            client_id: "c".into(),
            client_secret: "s".into(),
            auth_url: "https://github.com/login/oauth/authorize".into(),
            token_url: "https://github.com/login/oauth/access_token".into(),
            redirect_url: String::new(),
            scopes: vec![],
        }];

        let state = AppState::from_config(cfg).await.unwrap();
        assert!(state.integrations.handler("github").is_some());
        assert_eq!(state.registry.default_provider().await.as_deref(), Some("direct"));
    }

    #[tokio::test]
    async fn test_in_memory_state_from_config() {
        let state = AppState::from_config(config()).await.unwrap();
        assert!(state.registry.provider_names().await.is_empty());
        assert!(state.cloud.list("u1").await.unwrap().is_empty());
    }
}
