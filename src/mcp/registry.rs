//! Tool-provider registry: named providers, one default, and routing of
//! `provider:app` identifiers.
//!
//! - `gmail` goes to the default provider
//! - `composio:github` goes to `composio`, whether or not it is registered;
//!   an unregistered name fails at lookup, not at parse time

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::RwLock;

use super::provider::{create_provider, Provider, ProviderConfig};
use super::types::{ConnectToken, ConnectedApp, ProviderInfo, Tool, ToolResult};
use super::McpError;
use crate::errors::Result;

#[derive(Default)]
struct Inner {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_provider: Option<String>,
}

/// Owned by the application root and shared by handlers.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

/// Split on the first `:`. Without a prefix the default provider applies
/// and the whole identifier is the app.
pub fn parse_provider_app(id: &str, default_provider: &str) -> (String, String) {
    match id.split_once(':') {
        Some((provider, app)) if !provider.is_empty() => (provider.to_string(), app.to_string()),
        _ => (default_provider.to_string(), id.to_string()),
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_provider(&self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        let name = name.into();
        tracing::info!(provider = %name, kind = %provider.info().kind, "tool provider registered");
        self.inner.write().await.providers.insert(name, provider);
    }

    /// Build a provider from config and register it under its configured name.
    pub async fn create_provider(&self, config: &ProviderConfig) -> Result<String> {
        let provider = create_provider(config)?;
        let name = config.registry_name();
        self.add_provider(name.clone(), provider).await;
        Ok(name)
    }

    pub async fn remove_provider(&self, name: &str) -> bool {
        let mut inner = self.inner.write().await;
        if inner.default_provider.as_deref() == Some(name) {
            inner.default_provider = None;
        }
        inner.providers.remove(name).is_some()
    }

    pub async fn set_default_provider(&self, name: &str) -> std::result::Result<(), McpError> {
        let mut inner = self.inner.write().await;
        if !inner.providers.contains_key(name) {
            return Err(McpError::NotFound(name.to_string()));
        }
        inner.default_provider = Some(name.to_string());
        Ok(())
    }

    pub async fn default_provider(&self) -> Option<String> {
        self.inner.read().await.default_provider.clone()
    }

    pub async fn provider(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.inner.read().await.providers.get(name).cloned()
    }

    /// Provider metadata sorted by name.
    pub async fn list_providers(&self) -> Vec<ProviderInfo> {
        let inner = self.inner.read().await;
        let mut infos: Vec<ProviderInfo> = inner
            .providers
            .iter()
            .map(|(name, p)| {
                let mut info = p.info();
                info.name = name.clone();
                info
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub async fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().await.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn parse_provider_app(&self, id: &str) -> (String, String) {
        let inner = self.inner.read().await;
        parse_provider_app(id, inner.default_provider.as_deref().unwrap_or_default())
    }

    /// Resolve an identifier to `(provider name, provider, app)`.
    pub async fn resolve(&self, id: &str) -> std::result::Result<(String, Arc<dyn Provider>, String), McpError> {
        let inner = self.inner.read().await;
        let (name, app) = parse_provider_app(id, inner.default_provider.as_deref().unwrap_or_default());
        if name.is_empty() {
            return Err(McpError::NotFound("no default provider configured".into()));
        }
        let provider = inner
            .providers
            .get(&name)
            .cloned()
            .ok_or_else(|| McpError::NotFound(name.clone()))?;
        Ok((name, provider, app))
    }

    /// Tools for `provider:app`, descriptions prefixed with `[provider]`.
    pub async fn list_tools(&self, user_id: &str, provider_app: &str) -> std::result::Result<Vec<Tool>, McpError> {
        let (name, provider, app) = self.resolve(provider_app).await?;
        tracing::debug!(user_id = %user_id, provider = %name, app = %app, "listing tools");
        let mut tools = provider.list_tools(user_id, &app).await?;
        for tool in &mut tools {
            tool.description = format!("[{}] {}", name, tool.description);
        }
        Ok(tools)
    }

    pub async fn call_tool(
        &self,
        user_id: &str,
        provider_app: &str,
        tool: &str,
        input: Value,
    ) -> std::result::Result<ToolResult, McpError> {
        let (name, provider, app) = self.resolve(provider_app).await?;
        tracing::info!(user_id = %user_id, provider = %name, app = %app, tool = %tool, "calling tool");
        provider.call_tool(user_id, &app, tool, input).await
    }

    /// Connect token from the named provider, or the default one.
    pub async fn get_connect_token(
        &self,
        user_id: &str,
        provider_name: Option<&str>,
    ) -> std::result::Result<ConnectToken, McpError> {
        let name = match provider_name {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => self
                .default_provider()
                .await
                .ok_or_else(|| McpError::NotFound("no default provider configured".into()))?,
        };
        let provider = self.provider(&name).await.ok_or_else(|| McpError::NotFound(name.clone()))?;
        provider.get_connect_token(user_id).await
    }

    /// Apps connected across every provider, queried concurrently. Fails
    /// only when nothing succeeded and at least one provider errored.
    pub async fn list_connected_apps(&self, user_id: &str) -> std::result::Result<Vec<ConnectedApp>, McpError> {
        let providers: Vec<(String, Arc<dyn Provider>)> = {
            let inner = self.inner.read().await;
            let mut all: Vec<_> = inner.providers.iter().map(|(n, p)| (n.clone(), p.clone())).collect();
            all.sort_by(|a, b| a.0.cmp(&b.0));
            all
        };

        let results = join_all(providers.iter().map(|(name, p)| async move {
            (name.as_str(), p.list_connected_apps(user_id).await)
        }))
        .await;

        let mut apps = Vec::new();
        let mut errors = Vec::new();
        for (name, result) in results {
            match result {
                Ok(found) => apps.extend(found.into_iter().map(|mut app| {
                    app.provider = name.to_string();
                    app.name = format!("[{}] {}", name, app.name);
                    app
                })),
                Err(e) => {
                    tracing::warn!(user_id = %user_id, provider = %name, error = %e, "listing connected apps failed");
                    errors.push(format!("{}: {}", name, e));
                }
            }
        }

        if apps.is_empty() && !errors.is_empty() {
            return Err(McpError::Transport(format!("failed to list apps: {}", errors.join("; "))));
        }
        Ok(apps)
    }
}

// ── Tests ──────────────────────────────────────────────────────
