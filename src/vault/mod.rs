pub mod crypto;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::cloud::types::{
    AwsCredentialConfig, AzureCredentialConfig, CredentialConfig, GcpCredentialConfig,
    IbmCredentialConfig, KubernetesCredentialConfig, OracleCredentialConfig,
    PostgresCredentialConfig, ProviderType, StoredCredential,
};
use crate::errors::{BrokerError, Result};

pub use crypto::CredentialCipher;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Abstraction over where encrypted credential records live.
/// Implementations: MemoryBackend (map + one RwLock), SqliteBackend (sqlx).
///
/// Records passed through a backend are already sealed; backends never see
/// plaintext secrets.
#[async_trait]
pub trait CredentialBackend: Send + Sync {
    /// Insert or overwrite the record for `(record.user_id, record.provider())`.
    /// An existing record's `created_at` is kept.
    async fn put(&self, record: StoredCredential) -> Result<()>;

    async fn get(&self, user_id: &str, provider: ProviderType) -> Result<Option<StoredCredential>>;

    async fn list(&self, user_id: &str) -> Result<Vec<StoredCredential>>;

    /// Returns whether a record was removed.
    async fn delete(&self, user_id: &str, provider: ProviderType) -> Result<bool>;
}

/// Per-user, per-provider credential store with field-level encryption.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn CredentialBackend>,
    cipher: Arc<CredentialCipher>,
}

impl CredentialStore {
    pub fn new(encryption_key: &str, backend: Arc<dyn CredentialBackend>) -> Self {
        Self {
            backend,
            cipher: Arc::new(CredentialCipher::new(encryption_key)),
        }
    }

    pub fn in_memory(encryption_key: &str) -> Self {
        Self::new(encryption_key, Arc::new(MemoryBackend::new()))
    }

    /// Encrypt the config's secret fields and upsert it.
    pub async fn store(&self, user_id: &str, name: &str, mut config: CredentialConfig) -> Result<()> {
        if user_id.is_empty() {
            return Err(BrokerError::validation("user ID is required"));
        }
        let cipher = &self.cipher;
        config.for_each_secret(|field| {
            *field = cipher.encrypt(field)?;
            Ok(())
        })?;

        let provider = config.provider();
        let now = Utc::now();
        self.backend
            .put(StoredCredential {
                user_id: user_id.to_string(),
                name: name.to_string(),
                created_at: now,
                updated_at: now,
                config,
            })
            .await?;

        tracing::info!(user_id = %user_id, provider = %provider, "stored credentials");
        Ok(())
    }

    /// Fetch and decrypt the config for one provider.
    pub async fn get(&self, user_id: &str, provider: ProviderType) -> Result<CredentialConfig> {
        let record = self.backend.get(user_id, provider).await?.ok_or_else(|| {
            BrokerError::not_found(format!("no {} credentials found for user {}", provider, user_id))
        })?;

        let mut config = record.config;
        let cipher = &self.cipher;
        config.for_each_secret(|field| {
            *field = cipher.decrypt(field)?;
            Ok(())
        })?;
        Ok(config)
    }

    /// Records for `user_id` with every secret field stripped.
    pub async fn list(&self, user_id: &str) -> Result<Vec<StoredCredential>> {
        let mut records = self.backend.list(user_id).await?;
        for record in records.iter_mut() {
            record.config = record.config.redacted();
        }
        records.sort_by_key(|r| r.provider());
        Ok(records)
    }

    /// Idempotent: deleting a missing record succeeds with `false`.
    pub async fn delete(&self, user_id: &str, provider: ProviderType) -> Result<bool> {
        let removed = self.backend.delete(user_id, provider).await?;
        if removed {
            tracing::info!(user_id = %user_id, provider = %provider, "deleted credentials");
        }
        Ok(removed)
    }

    pub async fn has(&self, user_id: &str, provider: ProviderType) -> Result<bool> {
        Ok(self.backend.get(user_id, provider).await?.is_some())
    }

    /// The user's records, still encrypted, as JSON for backup.
    pub async fn export(&self, user_id: &str) -> Result<String> {
        let records = self.backend.list(user_id).await?;
        serde_json::to_string(&records).map_err(|e| BrokerError::Internal(e.into()))
    }

    /// Restore records produced by `export`. Every record must belong to
    /// `user_id` and decrypt with this store's key.
    pub async fn import(&self, user_id: &str, blob: &str) -> Result<usize> {
        let records: Vec<StoredCredential> = serde_json::from_str(blob)
            .map_err(|e| BrokerError::validation(format!("invalid backup: {}", e)))?;

        for record in &records {
            if record.user_id != user_id {
                return Err(BrokerError::validation("backup contains records for another user"));
            }
            let mut trial = record.config.clone();
            let cipher = &self.cipher;
            trial.for_each_secret(|field| cipher.decrypt(field).map(|_| ()))?;
        }

        let count = records.len();
        for record in records {
            self.backend.put(record).await?;
        }
        tracing::info!(user_id = %user_id, count, "imported credentials from backup");
        Ok(count)
    }

    pub async fn store_aws(&self, user_id: &str, name: &str, config: AwsCredentialConfig) -> Result<()> {
        self.store(user_id, name, CredentialConfig::Aws(config)).await
    }

    pub async fn store_gcp(&self, user_id: &str, name: &str, config: GcpCredentialConfig) -> Result<()> {
        self.store(user_id, name, CredentialConfig::Gcp(config)).await
    }

    pub async fn store_azure(&self, user_id: &str, name: &str, config: AzureCredentialConfig) -> Result<()> {
        self.store(user_id, name, CredentialConfig::Azure(config)).await
    }

    pub async fn store_ibm(&self, user_id: &str, name: &str, config: IbmCredentialConfig) -> Result<()> {
        self.store(user_id, name, CredentialConfig::Ibm(config)).await
    }

    pub async fn store_oracle(&self, user_id: &str, name: &str, config: OracleCredentialConfig) -> Result<()> {
        self.store(user_id, name, CredentialConfig::Oracle(config)).await
    }

    pub async fn store_kubernetes(
        &self,
        user_id: &str,
        name: &str,
        config: KubernetesCredentialConfig,
    ) -> Result<()> {
        self.store(user_id, name, CredentialConfig::Kubernetes(config)).await
    }

    pub async fn store_postgres(
        &self,
        user_id: &str,
        name: &str,
        config: PostgresCredentialConfig,
    ) -> Result<()> {
        self.store(user_id, name, CredentialConfig::Postgres(config)).await
    }

    pub async fn get_aws(&self, user_id: &str) -> Result<AwsCredentialConfig> {
        match self.get(user_id, ProviderType::Aws).await? {
            CredentialConfig::Aws(c) => Ok(c),
            other => Err(mismatch(ProviderType::Aws, &other)),
        }
    }

    pub async fn get_gcp(&self, user_id: &str) -> Result<GcpCredentialConfig> {
        match self.get(user_id, ProviderType::Gcp).await? {
            CredentialConfig::Gcp(c) => Ok(c),
            other => Err(mismatch(ProviderType::Gcp, &other)),
        }
    }

    pub async fn get_azure(&self, user_id: &str) -> Result<AzureCredentialConfig> {
        match self.get(user_id, ProviderType::Azure).await? {
            CredentialConfig::Azure(c) => Ok(c),
            other => Err(mismatch(ProviderType::Azure, &other)),
        }
    }

    pub async fn get_ibm(&self, user_id: &str) -> Result<IbmCredentialConfig> {
        match self.get(user_id, ProviderType::Ibm).await? {
            CredentialConfig::Ibm(c) => Ok(c),
            other => Err(mismatch(ProviderType::Ibm, &other)),
        }
    }

    pub async fn get_oracle(&self, user_id: &str) -> Result<OracleCredentialConfig> {
        match self.get(user_id, ProviderType::Oracle).await? {
            CredentialConfig::Oracle(c) => Ok(c),
            other => Err(mismatch(ProviderType::Oracle, &other)),
        }
    }

    pub async fn get_kubernetes(&self, user_id: &str) -> Result<KubernetesCredentialConfig> {
        match self.get(user_id, ProviderType::Kubernetes).await? {
            CredentialConfig::Kubernetes(c) => Ok(c),
            other => Err(mismatch(ProviderType::Kubernetes, &other)),
        }
    }

    pub async fn get_postgres(&self, user_id: &str) -> Result<PostgresCredentialConfig> {
        match self.get(user_id, ProviderType::Postgres).await? {
            CredentialConfig::Postgres(c) => Ok(c),
            other => Err(mismatch(ProviderType::Postgres, &other)),
        }
    }
}

fn mismatch(expected: ProviderType, found: &CredentialConfig) -> BrokerError {
    BrokerError::Internal(anyhow::anyhow!(
        "record under {} holds {} config",
        expected,
        found.provider()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aws_config() -> AwsCredentialConfig {
        AwsCredentialConfig {
            role_arn: "arn:aws:iam::123456789012:role/AgentRole".into(),
            region: "eu-west-1".into(),
            access_key_id: "AKIAEXAMPLE".into(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_store_and_get_decrypts() {
        let store = CredentialStore::in_memory("test-key");
        store.store_aws("user1", "prod", aws_config()).await.unwrap();

        let cfg = store.get_aws("user1").await.unwrap();
        assert_eq!(cfg, aws_config());
    }

    #[tokio::test]
    async fn test_secret_is_encrypted_inside_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let store = CredentialStore::new("test-key", backend.clone());
        store.store_aws("user1", "prod", aws_config()).await.unwrap();

        let raw = backend.get("user1", ProviderType::Aws).await.unwrap().unwrap();
        match raw.config {
            CredentialConfig::Aws(c) => {
                assert_ne!(c.secret_access_key, "wJalrXUtnFEMI/K7MDENG");
                assert!(!c.secret_access_key.is_empty());
            }
            other => panic!("unexpected config: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = CredentialStore::in_memory("test-key");
        assert!(matches!(store.get_gcp("nobody").await, Err(BrokerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_strips_secrets() {
        let store = CredentialStore::in_memory("test-key");
        store.store_aws("user1", "prod", aws_config()).await.unwrap();
        store
            .store_gcp(
                "user1",
                "gcp",
                GcpCredentialConfig {
                    service_account_json: r#"{"private_key":"x"}"#.into(),
                    project_id: "my-proj".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .store_postgres(
                "user1",
                "db",
                PostgresCredentialConfig {
                    host: "db".into(),
                    password: "hunter2".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let listed = store.list("user1").await.unwrap();
        assert_eq!(listed.len(), 3);
        for record in &listed {
            match &record.config {
                CredentialConfig::Aws(c) => {
                    assert!(c.secret_access_key.is_empty());
                    assert!(c.access_key_id.is_empty());
                    assert_eq!(c.role_arn, "arn:aws:iam::123456789012:role/AgentRole");
                }
                CredentialConfig::Gcp(c) => {
                    assert!(c.service_account_json.is_empty());
                    assert_eq!(c.project_id, "my-proj");
                }
                CredentialConfig::Postgres(c) => assert!(c.password.is_empty()),
                other => panic!("unexpected config: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_delete_and_has_are_idempotent() {
        let store = CredentialStore::in_memory("test-key");
        assert!(!store.has("user1", ProviderType::Aws).await.unwrap());
        assert!(!store.delete("user1", ProviderType::Aws).await.unwrap());

        store.store_aws("user1", "prod", aws_config()).await.unwrap();
        assert!(store.has("user1", ProviderType::Aws).await.unwrap());
        assert!(store.has("user1", ProviderType::Aws).await.unwrap());

        assert!(store.delete("user1", ProviderType::Aws).await.unwrap());
        assert!(!store.delete("user1", ProviderType::Aws).await.unwrap());
        assert!(!store.has("user1", ProviderType::Aws).await.unwrap());
    }

    #[tokio::test]
    async fn test_overwrite_keeps_single_record() {
        let store = CredentialStore::in_memory("test-key");
        store.store_aws("user1", "first", aws_config()).await.unwrap();
        let mut updated = aws_config();
        updated.region = "us-west-2".into();
        store.store_aws("user1", "second", updated).await.unwrap();

        let listed = store.list("user1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "second");
        assert_eq!(store.get_aws("user1").await.unwrap().region, "us-west-2");
    }

    #[tokio::test]
    async fn test_export_import_roundtrip() {
        let source = CredentialStore::in_memory("shared-key");
        source.store_aws("user1", "prod", aws_config()).await.unwrap();
        let blob = source.export("user1").await.unwrap();
        assert!(!blob.contains("wJalrXUtnFEMI"));

        let target = CredentialStore::in_memory("shared-key");
        assert_eq!(target.import("user1", &blob).await.unwrap(), 1);
        assert_eq!(target.get_aws("user1").await.unwrap(), aws_config());

        let wrong_key = CredentialStore::in_memory("other-key");
        assert!(matches!(
            wrong_key.import("user1", &blob).await,
            Err(BrokerError::Encryption(_))
        ));
        assert!(wrong_key.import("user2", &blob).await.is_err());
    }
}
