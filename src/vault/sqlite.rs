use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;

use super::CredentialBackend;
use crate::cloud::types::{CredentialConfig, ProviderType, StoredCredential};
use crate::errors::{BrokerError, Result};

/// Durable backend: one row per (user, provider) holding the sealed config JSON.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Connect (creating the file if needed) and ensure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // each in-memory connection is its own database
        let max = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max)
            .connect_with(options)
            .await?;
        let backend = Self { pool };
        backend.migrate().await?;
        Ok(backend)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cloud_credentials (
                user_id    TEXT NOT NULL,
                provider   TEXT NOT NULL,
                name       TEXT NOT NULL,
                config     TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, provider)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<StoredCredential> {
        let config: String = row.try_get("config")?;
        let config: CredentialConfig = serde_json::from_str(&config)
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("corrupt credential row: {}", e)))?;
        Ok(StoredCredential {
            user_id: row.try_get("user_id")?,
            name: row.try_get("name")?,
            created_at: parse_ts(row.try_get("created_at")?)?,
            updated_at: parse_ts(row.try_get("updated_at")?)?,
            config,
        })
    }
}

fn parse_ts(raw: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| BrokerError::Internal(anyhow::anyhow!("bad timestamp '{}': {}", raw, e)))
}

#[async_trait]
impl CredentialBackend for SqliteBackend {
    async fn put(&self, record: StoredCredential) -> Result<()> {
        let config = serde_json::to_string(&record.config)
            .map_err(|e| BrokerError::Internal(e.into()))?;
        sqlx::query(
            "INSERT INTO cloud_credentials (user_id, provider, name, config, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(user_id, provider) DO UPDATE SET \
                name = excluded.name, config = excluded.config, updated_at = excluded.updated_at",
        )
        .bind(&record.user_id)
        .bind(record.provider().as_str())
        .bind(&record.name)
        .bind(config)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, user_id: &str, provider: ProviderType) -> Result<Option<StoredCredential>> {
        let row = sqlx::query(
            "SELECT user_id, name, config, created_at, updated_at FROM cloud_credentials \
             WHERE user_id = ? AND provider = ?",
        )
        .bind(user_id)
        .bind(provider.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn list(&self, user_id: &str) -> Result<Vec<StoredCredential>> {
        let rows = sqlx::query(
            "SELECT user_id, name, config, created_at, updated_at FROM cloud_credentials \
             WHERE user_id = ? ORDER BY provider ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn delete(&self, user_id: &str, provider: ProviderType) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cloud_credentials WHERE user_id = ? AND provider = ?")
            .bind(user_id)
            .bind(provider.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::types::{AwsCredentialConfig, PostgresCredentialConfig};
    use crate::vault::CredentialStore;
    use std::sync::Arc;

    async fn backend() -> SqliteBackend {
        SqliteBackend::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_store_roundtrip_through_credential_store() {
        let store = CredentialStore::new("key", Arc::new(backend().await));
        store
            .store_aws(
                "user1",
                "prod",
                AwsCredentialConfig {
                    role_arn: "arn:aws:iam::123456789012:role/AgentRole".into(),
                    secret_access_key: "sk".into(),
                    access_key_id: "ak".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let cfg = store.get_aws("user1").await.unwrap();
        assert_eq!(cfg.secret_access_key, "sk");
        assert!(store.has("user1", ProviderType::Aws).await.unwrap());
        assert!(store.delete("user1", ProviderType::Aws).await.unwrap());
        assert!(!store.delete("user1", ProviderType::Aws).await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_keeps_created_at() {
        let backend = backend().await;
        let created = Utc::now() - chrono::Duration::hours(5);
        let record = StoredCredential {
            user_id: "u".into(),
            name: "first".into(),
            created_at: created,
            updated_at: created,
            config: CredentialConfig::Postgres(PostgresCredentialConfig::default()),
        };
        backend.put(record.clone()).await.unwrap();

        let mut second = record;
        second.name = "second".into();
        second.created_at = Utc::now();
        second.updated_at = Utc::now();
        backend.put(second).await.unwrap();

        let got = backend.get("u", ProviderType::Postgres).await.unwrap().unwrap();
        assert_eq!(got.name, "second");
        assert_eq!(got.created_at.timestamp(), created.timestamp());
        assert_eq!(backend.list("u").await.unwrap().len(), 1);
    }
}
