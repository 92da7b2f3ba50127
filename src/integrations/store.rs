//! Durable storage for user integrations. OAuth2 tokens are sealed with the
//! credential cipher before they reach a backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tokio::sync::RwLock;

use super::{OAuth2Token, UserIntegration};
use crate::errors::{BrokerError, Result};
use crate::vault::CredentialCipher;

/// A user integration as persisted: the token is ciphertext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedIntegration {
    pub user_id: String,
    pub integration_id: String,
    pub enabled: bool,
    pub connected_at: DateTime<Utc>,
    pub account_name: String,
    pub account_id: String,
    pub sealed_token: Option<String>,
}

#[async_trait]
pub trait IntegrationBackend: Send + Sync {
    /// Insert or overwrite the row for `(user_id, integration_id)`.
    async fn put(&self, record: SealedIntegration) -> Result<()>;

    async fn delete(&self, user_id: &str, integration_id: &str) -> Result<bool>;

    async fn load_all(&self) -> Result<Vec<SealedIntegration>>;
}

#[derive(Default)]
pub struct MemoryIntegrations {
    records: RwLock<HashMap<(String, String), SealedIntegration>>,
}

impl MemoryIntegrations {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IntegrationBackend for MemoryIntegrations {
    async fn put(&self, record: SealedIntegration) -> Result<()> {
        let key = (record.user_id.clone(), record.integration_id.clone());
        self.records.write().await.insert(key, record);
        Ok(())
    }

    async fn delete(&self, user_id: &str, integration_id: &str) -> Result<bool> {
        let key = (user_id.to_string(), integration_id.to_string());
        Ok(self.records.write().await.remove(&key).is_some())
    }

    async fn load_all(&self) -> Result<Vec<SealedIntegration>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

/// `user_integrations` table, sharing the credential store's pool.
#[derive(Clone)]
pub struct SqliteIntegrations {
    pool: SqlitePool,
}

impl SqliteIntegrations {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS user_integrations (
                user_id        TEXT NOT NULL,
                integration_id TEXT NOT NULL,
                enabled        INTEGER NOT NULL DEFAULT 1,
                connected_at   TEXT NOT NULL,
                account_name   TEXT NOT NULL DEFAULT '',
                account_id     TEXT NOT NULL DEFAULT '',
                oauth2_token   TEXT,
                updated_at     TEXT NOT NULL,
                PRIMARY KEY (user_id, integration_id)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl IntegrationBackend for SqliteIntegrations {
    async fn put(&self, record: SealedIntegration) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_integrations \
                (user_id, integration_id, enabled, connected_at, account_name, account_id, oauth2_token, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(user_id, integration_id) DO UPDATE SET \
                enabled = excluded.enabled, connected_at = excluded.connected_at, \
                account_name = excluded.account_name, account_id = excluded.account_id, \
                oauth2_token = excluded.oauth2_token, updated_at = excluded.updated_at",
        )
        .bind(&record.user_id)
        .bind(&record.integration_id)
        .bind(record.enabled)
        .bind(record.connected_at.to_rfc3339())
        .bind(&record.account_name)
        .bind(&record.account_id)
        .bind(&record.sealed_token)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, user_id: &str, integration_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM user_integrations WHERE user_id = ? AND integration_id = ?")
            .bind(user_id)
            .bind(integration_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_all(&self) -> Result<Vec<SealedIntegration>> {
        let rows = sqlx::query(
            "SELECT user_id, integration_id, enabled, connected_at, account_name, account_id, oauth2_token \
             FROM user_integrations",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<SealedIntegration> {
                let connected_at: String = row.try_get("connected_at")?;
                Ok(SealedIntegration {
                    user_id: row.try_get("user_id")?,
                    integration_id: row.try_get("integration_id")?,
                    enabled: row.try_get("enabled")?,
                    connected_at: DateTime::parse_from_rfc3339(&connected_at)
                        .map(|t| t.with_timezone(&Utc))
                        .map_err(|e| BrokerError::Internal(anyhow::anyhow!("bad timestamp '{}': {}", connected_at, e)))?,
                    account_name: row.try_get("account_name")?,
                    account_id: row.try_get("account_id")?,
                    sealed_token: row.try_get("oauth2_token")?,
                })
            })
            .collect()
    }
}

/// Seals tokens on the way in, opens them on the way out.
#[derive(Clone)]
pub struct IntegrationStore {
    backend: Arc<dyn IntegrationBackend>,
    cipher: Arc<CredentialCipher>,
}

impl IntegrationStore {
    pub fn new(encryption_key: &str, backend: Arc<dyn IntegrationBackend>) -> Self {
        Self {
            backend,
            cipher: Arc::new(CredentialCipher::new(encryption_key)),
        }
    }

    pub fn in_memory(encryption_key: &str) -> Self {
        Self::new(encryption_key, Arc::new(MemoryIntegrations::new()))
    }

    pub async fn save(&self, integration: &UserIntegration) -> Result<()> {
        let sealed_token = match &integration.oauth2_token {
            Some(token) => {
                let json = serde_json::to_string(token).map_err(|e| BrokerError::Internal(e.into()))?;
                Some(self.cipher.encrypt(&json)?)
            }
            None => None,
        };
        self.backend
            .put(SealedIntegration {
                user_id: integration.user_id.clone(),
                integration_id: integration.integration_id.clone(),
                enabled: integration.enabled,
                connected_at: integration.connected_at,
                account_name: integration.account_name.clone(),
                account_id: integration.account_id.clone(),
                sealed_token,
            })
            .await
    }

    pub async fn remove(&self, user_id: &str, integration_id: &str) -> Result<bool> {
        self.backend.delete(user_id, integration_id).await
    }

    /// Every persisted integration with its token decrypted.
    pub async fn load_all(&self) -> Result<Vec<UserIntegration>> {
        let mut out = Vec::new();
        for record in self.backend.load_all().await? {
            let oauth2_token = match &record.sealed_token {
                Some(sealed) => {
                    let json = self.cipher.decrypt(sealed)?;
                    let token: OAuth2Token = serde_json::from_str(&json)
                        .map_err(|e| BrokerError::Encryption(format!("corrupt integration token: {}", e)))?;
                    Some(token)
                }
                None => None,
            };
            out.push(UserIntegration {
                user_id: record.user_id,
                integration_id: record.integration_id,
                enabled: record.enabled,
                connected_at: record.connected_at,
                account_name: record.account_name,
                account_id: record.account_id,
                oauth2_token,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    fn token() -> OAuth2Token {
        OAuth2Token {
            access_token: "gho_access".into(),
            refresh_token: "ghr_refresh".into(),
            token_type: "Bearer".into(),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            scopes: vec!["repo".into()],
        }
    }

    async fn sqlite() -> SqliteIntegrations {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let backend = SqliteIntegrations::new(pool);
        backend.migrate().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_tokens_are_sealed_at_rest() {
        let backend = Arc::new(sqlite().await);
        let store = IntegrationStore::new("integration-key", backend.clone());
        let saved = token();
        store.save(&UserIntegration::new("u1", "github", saved.clone())).await.unwrap();

        let raw = backend.load_all().await.unwrap();
        assert_eq!(raw.len(), 1);
        let sealed = raw[0].sealed_token.as_deref().unwrap();
        assert!(!sealed.contains("gho_access"));
        assert!(!sealed.contains("ghr_refresh"));

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded[0].oauth2_token.as_ref(), Some(&saved));
    }

    #[tokio::test]
    async fn test_upsert_and_delete() {
        let backend = sqlite().await;
        let store = IntegrationStore::new("k", Arc::new(backend));
        let mut ui = UserIntegration::new("u1", "github", token());
        store.save(&ui).await.unwrap();
        ui.account_name = "octocat".into();
        store.save(&ui).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].account_name, "octocat");

        assert!(store.remove("u1", "github").await.unwrap());
        assert!(!store.remove("u1", "github").await.unwrap());
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_key_is_encryption_error() {
        let backend: Arc<dyn IntegrationBackend> = Arc::new(MemoryIntegrations::new());
        IntegrationStore::new("key-a", backend.clone())
            .save(&UserIntegration::new("u1", "github", token()))
            .await
            .unwrap();
        assert!(matches!(
            IntegrationStore::new("key-b", backend).load_all().await,
            Err(BrokerError::Encryption(_))
        ));
    }
}
