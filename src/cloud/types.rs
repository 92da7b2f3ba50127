use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{BrokerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Aws,
    Gcp,
    Azure,
    Ibm,
    Oracle,
    Kubernetes,
    Postgres,
}

impl ProviderType {
    pub const ALL: [ProviderType; 7] = [
        ProviderType::Aws,
        ProviderType::Gcp,
        ProviderType::Azure,
        ProviderType::Ibm,
        ProviderType::Oracle,
        ProviderType::Kubernetes,
        ProviderType::Postgres,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Aws => "aws",
            ProviderType::Gcp => "gcp",
            ProviderType::Azure => "azure",
            ProviderType::Ibm => "ibm",
            ProviderType::Oracle => "oracle",
            ProviderType::Kubernetes => "kubernetes",
            ProviderType::Postgres => "postgres",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aws" => Ok(ProviderType::Aws),
            "gcp" => Ok(ProviderType::Gcp),
            "azure" => Ok(ProviderType::Azure),
            "ibm" => Ok(ProviderType::Ibm),
            "oracle" | "oci" => Ok(ProviderType::Oracle),
            "kubernetes" | "k8s" => Ok(ProviderType::Kubernetes),
            "postgres" | "postgresql" => Ok(ProviderType::Postgres),
            other => Err(BrokerError::validation(format!("unknown provider: {}", other))),
        }
    }
}

// ── Stored configuration ─────────────────────────────────────

/// AWS role-assumption settings. `secret_access_key` is encrypted at rest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsCredentialConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account_id: String,
    /// e.g. `arn:aws:iam::123456789012:role/AgentRole`
    #[serde(default)]
    pub role_arn: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub external_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_duration_secs: Option<u64>,
    /// Source keys used to call STS. Backend defaults are used when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_key_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_access_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpCredentialConfig {
    /// Full service-account key JSON.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_json: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub impersonate_service_account: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureCredentialConfig {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_secret: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub certificate_pem: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subscription_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IbmCredentialConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_group: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleCredentialConfig {
    #[serde(default)]
    pub tenancy_ocid: String,
    #[serde(default)]
    pub user_ocid: String,
    #[serde(default)]
    pub fingerprint: String,
    /// API signing key. Never leaves the broker.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub private_key_pem: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub compartment_ocid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_ttl_minutes: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesCredentialConfig {
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub api_server: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_cert_pem: String,
    /// `token`, `exec`, `aws-eks`, `gcp-gke` or `azure-aks`.
    #[serde(default)]
    pub auth_method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub aws_cluster_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub aws_region: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gcp_project: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gcp_cluster: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gcp_zone: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub azure_cluster: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub azure_resource_group: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostgresCredentialConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssl_mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub connection_name: String,
}

impl PostgresCredentialConfig {
    /// libpq environment for the connection.
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("PGHOST".into(), self.host.clone());
        env.insert("PGPORT".into(), self.port.unwrap_or(5432).to_string());
        env.insert("PGDATABASE".into(), self.database.clone());
        env.insert("PGUSER".into(), self.username.clone());
        env.insert("PGPASSWORD".into(), self.password.clone());
        let ssl = if self.ssl_mode.is_empty() { "prefer" } else { &self.ssl_mode };
        env.insert("PGSSLMODE".into(), ssl.to_string());
        env
    }
}

/// One provider's stored configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", content = "settings", rename_all = "lowercase")]
pub enum CredentialConfig {
    Aws(AwsCredentialConfig),
    Gcp(GcpCredentialConfig),
    Azure(AzureCredentialConfig),
    Ibm(IbmCredentialConfig),
    Oracle(OracleCredentialConfig),
    Kubernetes(KubernetesCredentialConfig),
    Postgres(PostgresCredentialConfig),
}

impl CredentialConfig {
    pub fn provider(&self) -> ProviderType {
        match self {
            CredentialConfig::Aws(_) => ProviderType::Aws,
            CredentialConfig::Gcp(_) => ProviderType::Gcp,
            CredentialConfig::Azure(_) => ProviderType::Azure,
            CredentialConfig::Ibm(_) => ProviderType::Ibm,
            CredentialConfig::Oracle(_) => ProviderType::Oracle,
            CredentialConfig::Kubernetes(_) => ProviderType::Kubernetes,
            CredentialConfig::Postgres(_) => ProviderType::Postgres,
        }
    }

    /// Visit every populated secret-bearing field.
    pub fn for_each_secret<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut String) -> Result<()>,
    {
        let fields: Vec<&mut String> = match self {
            CredentialConfig::Aws(c) => vec![&mut c.secret_access_key],
            CredentialConfig::Gcp(c) => vec![&mut c.service_account_json],
            CredentialConfig::Azure(c) => vec![&mut c.client_secret, &mut c.certificate_pem],
            CredentialConfig::Ibm(c) => vec![&mut c.api_key],
            CredentialConfig::Oracle(c) => vec![&mut c.private_key_pem],
            CredentialConfig::Kubernetes(c) => vec![&mut c.token],
            CredentialConfig::Postgres(c) => vec![&mut c.password],
        };
        for field in fields {
            if !field.is_empty() {
                f(field)?;
            }
        }
        Ok(())
    }

    /// Copy safe to show in listings: secrets and source key IDs removed.
    pub fn redacted(&self) -> CredentialConfig {
        let mut copy = self.clone();
        // clearing cannot fail
        let _ = copy.for_each_secret(|s| {
            s.clear();
            Ok(())
        });
        if let CredentialConfig::Aws(c) = &mut copy {
            c.access_key_id.clear();
            c.external_id.clear();
        }
        copy
    }
}

/// A user's record for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredential {
    pub user_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub config: CredentialConfig,
}

impl StoredCredential {
    pub fn provider(&self) -> ProviderType {
        self.config.provider()
    }
}

// ── Ephemeral credentials ────────────────────────────────────

mod rfc3339_secs {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Temporary AWS keys in `credential_process` shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsTemporaryCredentials {
    #[serde(rename = "Version")]
    pub version: u8,
    #[serde(rename = "AccessKeyId")]
    pub access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    pub secret_access_key: String,
    #[serde(rename = "SessionToken")]
    pub session_token: String,
    #[serde(rename = "Expiration", with = "rfc3339_secs")]
    pub expiration: DateTime<Utc>,
}

/// Bearer token shape shared by GCP, Azure and IBM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl AccessToken {
    pub fn bearer(access_token: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            access_token,
            token_type: "Bearer".into(),
            expires_in: (expires_at - Utc::now()).num_seconds().max(0),
            expires_at,
            refresh_token: None,
            scope: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleSessionToken {
    pub token: String,
    /// Ephemeral private key bound to the session; not the user's API key.
    pub private_key: String,
    pub region: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KubernetesCredentials {
    pub kubeconfig: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Ready-to-print `ExecCredential` document when a token is available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_credential: Option<serde_json::Value>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresConnection {
    pub env: BTreeMap<String, String>,
}

/// Short-lived artifact handed to a sandbox. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EphemeralCredential {
    Aws(AwsTemporaryCredentials),
    Gcp(AccessToken),
    Azure(AccessToken),
    Ibm(AccessToken),
    Oracle(OracleSessionToken),
    Kubernetes(KubernetesCredentials),
    Postgres(PostgresConnection),
}

/// Sandbox credential fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRequest {
    pub sandbox_id: String,
    pub provider: ProviderType,
    #[serde(default)]
    pub session_token: String,
}

/// Either a credential or an error string, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialResponse {
    pub provider: ProviderType,
    #[serde(flatten)]
    pub credential: Option<EphemeralCredential>,
    /// Environment variables for tools that read credentials from env.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CredentialResponse {
    pub fn ok(credential: EphemeralCredential) -> Self {
        Self {
            provider: match &credential {
                EphemeralCredential::Aws(_) => ProviderType::Aws,
                EphemeralCredential::Gcp(_) => ProviderType::Gcp,
                EphemeralCredential::Azure(_) => ProviderType::Azure,
                EphemeralCredential::Ibm(_) => ProviderType::Ibm,
                EphemeralCredential::Oracle(_) => ProviderType::Oracle,
                EphemeralCredential::Kubernetes(_) => ProviderType::Kubernetes,
                EphemeralCredential::Postgres(_) => ProviderType::Postgres,
            },
            credential: Some(credential),
            env: None,
            error: None,
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn failed(provider: ProviderType, error: impl fmt::Display) -> Self {
        Self {
            provider,
            credential: None,
            env: None,
            error: Some(error.to_string()),
        }
    }
}
