use async_trait::async_trait;

use super::types::{CredentialConfig, EphemeralCredential, PostgresConnection, PostgresCredentialConfig, ProviderType};
use super::CloudAdapter;
use crate::errors::{BrokerError, Result};

/// No exchange exists for database passwords; the libpq environment is handed
/// out only through the token-gated fetch.
#[derive(Default)]
pub struct PostgresAdapter;

#[async_trait]
impl CloudAdapter for PostgresAdapter {
    fn provider(&self) -> ProviderType {
        ProviderType::Postgres
    }

    fn validate(&self, config: &CredentialConfig) -> Result<()> {
        match config {
            CredentialConfig::Postgres(c) => validate_config(c),
            _ => Err(BrokerError::validation("expected Postgres configuration")),
        }
    }

    async fn exchange(&self, config: &CredentialConfig, _sandbox_id: &str) -> Result<EphemeralCredential> {
        match config {
            CredentialConfig::Postgres(c) => Ok(EphemeralCredential::Postgres(PostgresConnection { env: c.env() })),
            _ => Err(BrokerError::validation("expected Postgres configuration")),
        }
    }
}

pub fn validate_config(config: &PostgresCredentialConfig) -> Result<()> {
    if config.host.is_empty() || config.database.is_empty() || config.username.is_empty() {
        return Err(BrokerError::validation("host, database and username are required"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exchange_returns_libpq_env() {
        let cfg = PostgresCredentialConfig {
            host: "db".into(),
            database: "app".into(),
            username: "agent".into(),
            password: "pw".into(),
            port: Some(6543),
            ..Default::default()
        };
        let adapter = PostgresAdapter;
        assert!(adapter.validate(&CredentialConfig::Postgres(cfg.clone())).is_ok());
        match adapter.exchange(&CredentialConfig::Postgres(cfg), "S1").await.unwrap() {
            EphemeralCredential::Postgres(conn) => {
                assert_eq!(conn.env["PGPORT"], "6543");
                assert_eq!(conn.env["PGPASSWORD"], "pw");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_validation_requires_connection_fields() {
        assert!(validate_config(&PostgresCredentialConfig::default()).is_err());
    }
}
