use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::CredentialBackend;
use crate::cloud::types::{ProviderType, StoredCredential};
use crate::errors::Result;

/// userID -> provider -> record, behind one reader/writer lock.
#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<String, HashMap<ProviderType, StoredCredential>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialBackend for MemoryBackend {
    async fn put(&self, mut record: StoredCredential) -> Result<()> {
        let mut records = self.records.write().await;
        let user = records.entry(record.user_id.clone()).or_default();
        if let Some(existing) = user.get(&record.provider()) {
            record.created_at = existing.created_at;
        }
        user.insert(record.provider(), record);
        Ok(())
    }

    async fn get(&self, user_id: &str, provider: ProviderType) -> Result<Option<StoredCredential>> {
        let records = self.records.read().await;
        Ok(records.get(user_id).and_then(|u| u.get(&provider)).cloned())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<StoredCredential>> {
        let records = self.records.read().await;
        Ok(records
            .get(user_id)
            .map(|u| u.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, user_id: &str, provider: ProviderType) -> Result<bool> {
        let mut records = self.records.write().await;
        let Some(user) = records.get_mut(user_id) else {
            return Ok(false);
        };
        let removed = user.remove(&provider).is_some();
        if user.is_empty() {
            records.remove(user_id);
        }
        Ok(removed)
    }
}
