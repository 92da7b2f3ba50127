pub mod aws;
pub mod azure;
pub mod gcp;
pub mod helpers;
pub mod http;
pub mod ibm;
pub mod kubernetes;
pub mod manager;
pub mod oci_signing;
pub mod oracle;
pub mod postgres;
pub mod sigv4;
pub mod types;

use async_trait::async_trait;

use crate::errors::Result;

pub use manager::Manager;
pub use types::{CredentialConfig, CredentialRequest, CredentialResponse, EphemeralCredential, ProviderType};

/// Turns one provider's long-lived configuration into a short-lived artifact.
///
/// Adapters hold no per-call state; everything an exchange needs arrives
/// through `config`.
#[async_trait]
pub trait CloudAdapter: Send + Sync {
    fn provider(&self) -> ProviderType;

    /// Local checks run before a configuration is persisted.
    fn validate(&self, _config: &CredentialConfig) -> Result<()> {
        Ok(())
    }

    async fn exchange(&self, config: &CredentialConfig, sandbox_id: &str) -> Result<EphemeralCredential>;
}
