use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};

use super::aws::AwsAdapter;
use super::azure::{self, AzureAdapter};
use super::gcp::GcpAdapter;
use super::helpers::{ExecutableResponse, ProviderHints, SandboxConfig};
use super::ibm::{self, IbmAdapter};
use super::kubernetes::KubernetesAdapter;
use super::oracle::OracleAdapter;
use super::postgres::PostgresAdapter;
use super::types::{
    AwsCredentialConfig, AzureCredentialConfig, CredentialConfig, CredentialRequest, CredentialResponse,
    EphemeralCredential, GcpCredentialConfig, IbmCredentialConfig, KubernetesCredentialConfig, OracleCredentialConfig,
    PostgresCredentialConfig, ProviderType, StoredCredential,
};
use super::CloudAdapter;
use crate::auth::{Scope, SessionClaims, TokenIssuer};
use crate::errors::{AuthError, BrokerError, Result};
use crate::vault::CredentialStore;

/// Scopes carried by the token baked into sandbox helpers.
const SANDBOX_SCOPES: [Scope; 3] = [Scope::CloudCredentials, Scope::ListTools, Scope::CallTools];

/// Routes credential requests to provider adapters over one store.
#[derive(Clone)]
pub struct Manager {
    store: CredentialStore,
    issuer: Arc<TokenIssuer>,
    adapters: HashMap<ProviderType, Arc<dyn CloudAdapter>>,
    backend_url: String,
    gcp_audience: Option<String>,
}

impl Manager {
    /// Manager with the stock adapter for every provider.
    pub fn new(
        store: CredentialStore,
        issuer: Arc<TokenIssuer>,
        backend_url: impl Into<String>,
        aws_defaults: Option<(String, String)>,
    ) -> Self {
        let mut manager = Self {
            store,
            issuer,
            adapters: HashMap::new(),
            backend_url: backend_url.into(),
            gcp_audience: None,
        };
        let defaults: [Arc<dyn CloudAdapter>; 7] = [
            Arc::new(AwsAdapter::new(aws_defaults)),
            Arc::new(GcpAdapter::new()),
            Arc::new(AzureAdapter::new()),
            Arc::new(IbmAdapter::new()),
            Arc::new(OracleAdapter::new()),
            Arc::new(KubernetesAdapter::new()),
            Arc::new(PostgresAdapter),
        ];
        for adapter in defaults {
            manager.adapters.insert(adapter.provider(), adapter);
        }
        manager
    }

    /// Replace the adapter registered for `adapter.provider()`.
    pub fn with_adapter(mut self, adapter: Arc<dyn CloudAdapter>) -> Self {
        self.adapters.insert(adapter.provider(), adapter);
        self
    }

    pub fn with_gcp_audience(mut self, audience: Option<String>) -> Self {
        self.gcp_audience = audience;
        self
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn issuer(&self) -> &Arc<TokenIssuer> {
        &self.issuer
    }

    fn adapter(&self, provider: ProviderType) -> Result<&Arc<dyn CloudAdapter>> {
        self.adapters
            .get(&provider)
            .ok_or_else(|| BrokerError::config(format!("no adapter registered for {}", provider)))
    }

    // ── store / list / delete ────────────────────────────────

    /// Validate, then persist. Any failure is returned to the caller.
    pub async fn store_credentials(&self, user_id: &str, name: &str, config: CredentialConfig) -> Result<()> {
        self.adapter(config.provider())?.validate(&config)?;
        self.store.store(user_id, name, config).await
    }

    pub async fn store_aws(&self, user_id: &str, name: &str, config: AwsCredentialConfig) -> Result<()> {
        self.store_credentials(user_id, name, CredentialConfig::Aws(config)).await
    }

    pub async fn store_gcp(&self, user_id: &str, name: &str, config: GcpCredentialConfig) -> Result<()> {
        self.store_credentials(user_id, name, CredentialConfig::Gcp(config)).await
    }

    pub async fn store_azure(&self, user_id: &str, name: &str, config: AzureCredentialConfig) -> Result<()> {
        self.store_credentials(user_id, name, CredentialConfig::Azure(config)).await
    }

    pub async fn store_ibm(&self, user_id: &str, name: &str, config: IbmCredentialConfig) -> Result<()> {
        self.store_credentials(user_id, name, CredentialConfig::Ibm(config)).await
    }

    pub async fn store_oracle(&self, user_id: &str, name: &str, config: OracleCredentialConfig) -> Result<()> {
        self.store_credentials(user_id, name, CredentialConfig::Oracle(config)).await
    }

    pub async fn store_kubernetes(&self, user_id: &str, name: &str, config: KubernetesCredentialConfig) -> Result<()> {
        self.store_credentials(user_id, name, CredentialConfig::Kubernetes(config)).await
    }

    pub async fn store_postgres(&self, user_id: &str, name: &str, config: PostgresCredentialConfig) -> Result<()> {
        self.store_credentials(user_id, name, CredentialConfig::Postgres(config)).await
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<StoredCredential>> {
        self.store.list(user_id).await
    }

    pub async fn delete(&self, user_id: &str, provider: ProviderType) -> Result<bool> {
        self.store.delete(user_id, provider).await
    }

    pub async fn has(&self, user_id: &str, provider: ProviderType) -> Result<bool> {
        self.store.has(user_id, provider).await
    }

    // ── sandbox-facing ───────────────────────────────────────

    /// Token must be valid, carry `scope` and be minted for the requesting
    /// sandbox.
    pub fn authorize(&self, session_token: &str, sandbox_id: &str, scope: Scope) -> Result<SessionClaims> {
        let claims = self.issuer.validate_with_scope(session_token, scope)?;
        if claims.sandbox_id != sandbox_id {
            tracing::warn!(
                user_id = %claims.user_id,
                sandbox_id = %sandbox_id,
                "session token presented by a different sandbox"
            );
            return Err(AuthError::SandboxMismatch.into());
        }
        Ok(claims)
    }

    /// Sandbox credential fetch. Token problems are hard errors; everything
    /// after authorization is reported inside the response.
    pub async fn get_credentials(&self, req: &CredentialRequest) -> Result<CredentialResponse> {
        let claims = self.authorize(&req.session_token, &req.sandbox_id, Scope::CloudCredentials)?;
        Ok(self.exchange(&claims.user_id, req.provider, &req.sandbox_id).await)
    }

    /// Look up the user's config and run the provider exchange.
    pub async fn exchange(&self, user_id: &str, provider: ProviderType, sandbox_id: &str) -> CredentialResponse {
        match self.try_exchange(user_id, provider, sandbox_id).await {
            Ok(resp) => {
                tracing::info!(user_id = %user_id, provider = %provider, sandbox_id = %sandbox_id, "issued ephemeral credentials");
                resp
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    provider = %provider,
                    sandbox_id = %sandbox_id,
                    error = %e,
                    "credential exchange failed"
                );
                CredentialResponse::failed(provider, e)
            }
        }
    }

    async fn try_exchange(&self, user_id: &str, provider: ProviderType, sandbox_id: &str) -> Result<CredentialResponse> {
        let config = match self.store.get(user_id, provider).await {
            Ok(c) => c,
            Err(BrokerError::NotFound(_)) => {
                return Err(BrokerError::config(format!("no {} credentials configured", provider)))
            }
            Err(e) => return Err(e),
        };
        let credential = self.adapter(provider)?.exchange(&config, sandbox_id).await?;

        let env = match (&credential, &config) {
            (EphemeralCredential::Azure(token), CredentialConfig::Azure(c)) => Some(azure::env_config(token, c)),
            (EphemeralCredential::Ibm(token), CredentialConfig::Ibm(c)) => Some(ibm::env_config(token, c)),
            (EphemeralCredential::Postgres(conn), _) => Some(conn.env.clone()),
            _ => None,
        };
        let resp = CredentialResponse::ok(credential);
        Ok(match env {
            Some(env) => resp.with_env(env),
            None => resp,
        })
    }

    /// Session token plus helper files for every provider the user has
    /// connected.
    pub async fn sandbox_config(&self, user_id: &str, sandbox_id: &str, conversation_id: &str) -> Result<SandboxConfig> {
        if sandbox_id.is_empty() {
            return Err(BrokerError::validation("sandbox ID is required"));
        }
        let session_token = self.issuer.issue(user_id, conversation_id, sandbox_id, &SANDBOX_SCOPES)?;
        let mut bundle = SandboxConfig::new(&self.backend_url, &session_token, sandbox_id);

        let connected = self.store.list(user_id).await?;
        let mut hints = ProviderHints {
            gcp_audience: self.gcp_audience.clone(),
            oci_profile: super::oracle::DEFAULT_PROFILE.to_string(),
            ..Default::default()
        };
        for record in &connected {
            if let CredentialConfig::Aws(c) = &record.config {
                hints.aws_region = c.region.clone();
            }
        }
        for record in &connected {
            bundle
                .add_provider(record.provider(), &hints)
                .map_err(|e| BrokerError::Internal(e.into()))?;
        }

        tracing::info!(
            user_id = %user_id,
            sandbox_id = %sandbox_id,
            providers = connected.len(),
            "generated sandbox credential config"
        );
        Ok(bundle)
    }

    /// Token a sandbox presents to Google STS as its workload identity.
    pub fn subject_token(&self, user_id: &str, sandbox_id: &str, conversation_id: &str) -> Result<String> {
        self.issuer.issue(user_id, conversation_id, sandbox_id, &[Scope::GcpToken])
    }

    /// Executable-source output for the sandbox holding `session_token`.
    pub fn gcp_executable_response(&self, session_token: &str, sandbox_id: &str) -> Result<ExecutableResponse> {
        let claims = self.authorize(session_token, sandbox_id, Scope::CloudCredentials)?;
        let token = self.subject_token(&claims.user_id, sandbox_id, &claims.conversation_id)?;
        let issued = self.issuer.validate(&token)?;
        let expires_at = Utc
            .timestamp_opt(issued.exp, 0)
            .single()
            .ok_or_else(|| BrokerError::Internal(anyhow::anyhow!("subject token expiry out of range")))?;
        Ok(ExecutableResponse::jwt(token, expires_at))
    }
}
