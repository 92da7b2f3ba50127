use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::{IntegrationStore, OAuth2Handler, OAuth2Token, UserIntegration};
use crate::errors::{BrokerError, Result};
use crate::mcp::TokenSource;

/// Tokens this close to expiry are refreshed before use.
pub const REFRESH_BUFFER_SECS: i64 = 120;

type EntryKey = (String, String);

/// User integrations keyed by (user, integration). Each entry has its own
/// async lock, so at most one refresh runs per entry and readers of other
/// entries never wait on it. With a store attached, every connect, disconnect
/// and refresh is written through before the call returns.
#[derive(Default)]
pub struct TokenCache {
    entries: DashMap<EntryKey, Arc<Mutex<UserIntegration>>>,
    handlers: DashMap<String, Arc<dyn OAuth2Handler>>,
    store: Option<IntegrationStore>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache backed by `store`, loaded with everything it already holds.
    pub async fn with_store(store: IntegrationStore) -> Result<Self> {
        let entries = DashMap::new();
        for integration in store.load_all().await? {
            let key = (integration.user_id.clone(), integration.integration_id.clone());
            entries.insert(key, Arc::new(Mutex::new(integration)));
        }
        tracing::info!(count = entries.len(), "integrations loaded");
        Ok(Self {
            entries,
            handlers: DashMap::new(),
            store: Some(store),
        })
    }

    pub fn register_handler(&self, integration_id: &str, handler: Arc<dyn OAuth2Handler>) {
        self.handlers.insert(integration_id.to_string(), handler);
    }

    pub fn handler(&self, integration_id: &str) -> Option<Arc<dyn OAuth2Handler>> {
        self.handlers.get(integration_id).map(|h| h.value().clone())
    }

    /// Insert or replace a user's connection.
    pub async fn connect(&self, integration: UserIntegration) -> Result<()> {
        if let Some(store) = &self.store {
            store.save(&integration).await?;
        }
        tracing::info!(
            user_id = %integration.user_id,
            integration = %integration.integration_id,
            "integration connected"
        );
        let key = (integration.user_id.clone(), integration.integration_id.clone());
        self.entries.insert(key, Arc::new(Mutex::new(integration)));
        Ok(())
    }

    /// Complete an authorization-code flow and store the result.
    pub async fn connect_with_code(&self, user_id: &str, integration_id: &str, code: &str) -> Result<()> {
        let handler = self
            .handler(integration_id)
            .ok_or_else(|| BrokerError::config(format!("oauth2 handler not registered: {}", integration_id)))?;
        let token = handler.exchange_code(code).await?;
        self.connect(UserIntegration::new(user_id, integration_id, token)).await
    }

    pub async fn disconnect(&self, user_id: &str, integration_id: &str) -> Result<bool> {
        let stored = match &self.store {
            Some(store) => store.remove(user_id, integration_id).await?,
            None => false,
        };
        let cached = self
            .entries
            .remove(&(user_id.to_string(), integration_id.to_string()))
            .is_some();
        Ok(cached || stored)
    }

    fn entry(&self, user_id: &str, integration_id: &str) -> Option<Arc<Mutex<UserIntegration>>> {
        self.entries
            .get(&(user_id.to_string(), integration_id.to_string()))
            .map(|e| e.value().clone())
    }

    pub async fn get(&self, user_id: &str, integration_id: &str) -> Option<UserIntegration> {
        match self.entry(user_id, integration_id) {
            Some(entry) => Some(entry.lock().await.clone()),
            None => None,
        }
    }

    pub async fn list(&self, user_id: &str) -> Vec<UserIntegration> {
        let entries: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == user_id)
            .map(|e| e.value().clone())
            .collect();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(entry.lock().await.clone());
        }
        out.sort_by(|a, b| a.integration_id.cmp(&b.integration_id));
        out
    }

    /// A usable access token, refreshed first when it expires within the
    /// buffer. Concurrent callers for the same entry share one refresh.
    pub async fn get_access_token(&self, user_id: &str, integration_id: &str) -> Result<String> {
        let entry = self
            .entry(user_id, integration_id)
            .ok_or_else(|| BrokerError::not_found(format!("oauth2 integration not connected: {}", integration_id)))?;

        let mut integration = entry.lock().await;
        if !integration.enabled {
            return Err(BrokerError::config(format!("integration disabled: {}", integration_id)));
        }
        let token = integration
            .oauth2_token
            .as_ref()
            .ok_or_else(|| BrokerError::config(format!("integration has no oauth2 token: {}", integration_id)))?;

        if is_fresh(token) {
            return Ok(token.access_token.clone());
        }

        let handler = self
            .handler(integration_id)
            .ok_or_else(|| BrokerError::config(format!("oauth2 handler not registered: {}", integration_id)))?;
        if token.refresh_token.is_empty() {
            return Err(BrokerError::config(format!("oauth2 refresh token missing: {}", integration_id)));
        }

        let mut refreshed = handler.refresh(&token.refresh_token).await?;
        if refreshed.refresh_token.is_empty() {
            refreshed.refresh_token = token.refresh_token.clone();
        }
        let access = refreshed.access_token.clone();
        integration.oauth2_token = Some(refreshed);
        if let Some(store) = &self.store {
            store.save(&integration).await?;
        }
        tracing::info!(user_id = %user_id, integration = %integration_id, "oauth2 token refreshed");
        Ok(access)
    }

    /// Per-user token source for one integration, for providers that call
    /// upstream as the user.
    pub fn token_source(self: &Arc<Self>, integration_id: &str) -> Arc<dyn TokenSource> {
        Arc::new(IntegrationTokenSource {
            cache: Arc::clone(self),
            integration_id: integration_id.to_string(),
        })
    }
}

fn is_fresh(token: &OAuth2Token) -> bool {
    match token.expires_at {
        None => true,
        Some(at) => at > Utc::now() + Duration::seconds(REFRESH_BUFFER_SECS),
    }
}

pub struct IntegrationTokenSource {
    cache: Arc<TokenCache>,
    integration_id: String,
}

#[async_trait]
impl TokenSource for IntegrationTokenSource {
    async fn access_token(&self, user_id: &str) -> Result<String> {
        self.cache.get_access_token(user_id, &self.integration_id).await
    }
}
