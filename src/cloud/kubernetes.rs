use std::str::FromStr;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Serialize;

use super::types::{CredentialConfig, EphemeralCredential, KubernetesCredentialConfig, KubernetesCredentials, ProviderType};
use super::CloudAdapter;
use crate::errors::{BrokerError, Result};

pub const EXEC_API_VERSION: &str = "client.authentication.k8s.io/v1beta1";
pub const HELPER_PATH: &str = "/usr/local/bin/k8s-credential-helper";
const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_EKS_REGION: &str = "us-east-1";
/// Azure Kubernetes Service AAD server application ID.
const AKS_SERVER_ID: &str = "6dae42f8-4368-4678-94ff-3960e28e3630";
const KUBECONFIG_TTL_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Token,
    Exec,
    AwsEks,
    GcpGke,
    AzureAks,
}

impl FromStr for AuthMethod {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "token" => Ok(AuthMethod::Token),
            "exec" => Ok(AuthMethod::Exec),
            "aws-eks" => Ok(AuthMethod::AwsEks),
            "gcp-gke" => Ok(AuthMethod::GcpGke),
            "azure-aks" => Ok(AuthMethod::AzureAks),
            "" => Err(BrokerError::validation("authMethod is required")),
            other => Err(BrokerError::config(format!("unsupported auth method: {}", other))),
        }
    }
}

// ── kubeconfig document ──────────────────────────────────────

#[derive(Serialize)]
struct Kubeconfig {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    #[serde(rename = "current-context")]
    current_context: String,
    clusters: Vec<Named<Cluster>>,
    contexts: Vec<Named<Context>>,
    users: Vec<Named<User>>,
}

#[derive(Serialize)]
struct Named<T> {
    name: String,
    #[serde(flatten)]
    item: T,
}

#[derive(Serialize)]
struct Cluster {
    cluster: ClusterSpec,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterSpec {
    server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate_authority_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    insecure_skip_tls_verify: Option<bool>,
}

#[derive(Serialize)]
struct Context {
    context: ContextSpec,
}

#[derive(Serialize)]
struct ContextSpec {
    cluster: String,
    user: String,
    namespace: String,
}

#[derive(Serialize)]
struct User {
    user: UserSpec,
}

#[derive(Serialize)]
struct UserSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exec: Option<ExecConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecConfig {
    api_version: &'static str,
    command: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    args: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    env: Vec<EnvVar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    install_hint: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    provide_cluster_info: bool,
}

#[derive(Serialize)]
struct EnvVar {
    name: String,
    value: String,
}

fn exec(command: &str, args: &[&str]) -> ExecConfig {
    ExecConfig {
        api_version: EXEC_API_VERSION,
        command: command.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        env: Vec::new(),
        install_hint: None,
        provide_cluster_info: false,
    }
}

/// Synthesises kubeconfigs; the only cluster access it ever embeds is a
/// token the user stored for the `token` method.
#[derive(Default)]
pub struct KubernetesAdapter;

impl KubernetesAdapter {
    pub fn new() -> Self {
        Self
    }

    pub fn credentials(&self, config: &KubernetesCredentialConfig, sandbox_id: &str) -> Result<KubernetesCredentials> {
        validate_config(config)?;
        let method: AuthMethod = config.auth_method.parse()?;
        let expires_at = Utc::now() + Duration::minutes(KUBECONFIG_TTL_MINUTES);

        let token = match method {
            AuthMethod::Token | AuthMethod::Exec if !config.token.is_empty() => Some(config.token.clone()),
            _ => None,
        };
        let exec_credential = token.as_deref().map(|t| exec_credential(t, expires_at));

        Ok(KubernetesCredentials {
            kubeconfig: kubeconfig(config, method, sandbox_id)?,
            token,
            exec_credential,
            expires_at,
        })
    }
}

#[async_trait]
impl CloudAdapter for KubernetesAdapter {
    fn provider(&self) -> ProviderType {
        ProviderType::Kubernetes
    }

    fn validate(&self, config: &CredentialConfig) -> Result<()> {
        match config {
            CredentialConfig::Kubernetes(c) => validate_config(c),
            _ => Err(BrokerError::validation("expected Kubernetes configuration")),
        }
    }

    async fn exchange(&self, config: &CredentialConfig, sandbox_id: &str) -> Result<EphemeralCredential> {
        match config {
            CredentialConfig::Kubernetes(c) => Ok(EphemeralCredential::Kubernetes(self.credentials(c, sandbox_id)?)),
            _ => Err(BrokerError::validation("expected Kubernetes configuration")),
        }
    }
}

pub fn validate_config(config: &KubernetesCredentialConfig) -> Result<()> {
    if config.cluster_name.is_empty() {
        return Err(BrokerError::validation("clusterName is required"));
    }
    if config.api_server.is_empty() {
        return Err(BrokerError::validation("apiServer is required"));
    }
    match config.auth_method.parse::<AuthMethod>()? {
        AuthMethod::Token if config.token.is_empty() => {
            Err(BrokerError::validation("token is required for token auth"))
        }
        AuthMethod::AwsEks if config.aws_cluster_name.is_empty() || config.aws_region.is_empty() => {
            Err(BrokerError::validation("awsClusterName and awsRegion are required for EKS"))
        }
        AuthMethod::GcpGke
            if config.gcp_project.is_empty() || config.gcp_cluster.is_empty() || config.gcp_zone.is_empty() =>
        {
            Err(BrokerError::validation("gcpProject, gcpCluster and gcpZone are required for GKE"))
        }
        AuthMethod::AzureAks if config.azure_cluster.is_empty() || config.azure_resource_group.is_empty() => {
            Err(BrokerError::validation("azureCluster and azureResourceGroup are required for AKS"))
        }
        _ => Ok(()),
    }
}

fn namespace(config: &KubernetesCredentialConfig) -> String {
    if config.namespace.is_empty() {
        DEFAULT_NAMESPACE.to_string()
    } else {
        config.namespace.clone()
    }
}

/// kubeconfig YAML for `method`. The CA is base64-embedded when present;
/// otherwise TLS verification is skipped.
pub fn kubeconfig(config: &KubernetesCredentialConfig, method: AuthMethod, sandbox_id: &str) -> Result<String> {
    let name = config.cluster_name.clone();
    let user = match method {
        AuthMethod::Token => UserSpec {
            token: Some(config.token.clone()),
            exec: None,
        },
        AuthMethod::Exec => UserSpec {
            token: None,
            exec: Some(exec(HELPER_PATH, &["--sandbox-id", sandbox_id])),
        },
        AuthMethod::AwsEks => {
            let region = if config.aws_region.is_empty() { DEFAULT_EKS_REGION } else { config.aws_region.as_str() };
            let mut stanza = exec(
                "aws",
                &["eks", "get-token", "--cluster-name", config.aws_cluster_name.as_str(), "--region", region],
            );
            stanza.env.push(EnvVar {
                name: "AWS_PROFILE".into(),
                value: "default".into(),
            });
            UserSpec {
                token: None,
                exec: Some(stanza),
            }
        }
        AuthMethod::GcpGke => {
            let mut stanza = exec("gke-gcloud-auth-plugin", &[]);
            stanza.install_hint = Some(
                "Install gke-gcloud-auth-plugin: https://cloud.google.com/kubernetes-engine/docs/how-to/cluster-access-for-kubectl"
                    .into(),
            );
            stanza.provide_cluster_info = true;
            UserSpec {
                token: None,
                exec: Some(stanza),
            }
        }
        AuthMethod::AzureAks => UserSpec {
            token: None,
            exec: Some(exec(
                "kubelogin",
                &["get-token", "--environment", "AzurePublicCloud", "--server-id", AKS_SERVER_ID, "--login", "azurecli"],
            )),
        },
    };

    let (certificate_authority_data, insecure_skip_tls_verify) = if config.ca_cert_pem.is_empty() {
        (None, Some(true))
    } else {
        (Some(STANDARD.encode(config.ca_cert_pem.as_bytes())), None)
    };

    let doc = Kubeconfig {
        api_version: "v1",
        kind: "Config",
        current_context: name.clone(),
        clusters: vec![Named {
            name: name.clone(),
            item: Cluster {
                cluster: ClusterSpec {
                    server: config.api_server.clone(),
                    certificate_authority_data,
                    insecure_skip_tls_verify,
                },
            },
        }],
        contexts: vec![Named {
            name: name.clone(),
            item: Context {
                context: ContextSpec {
                    cluster: name.clone(),
                    user: name.clone(),
                    namespace: namespace(config),
                },
            },
        }],
        users: vec![Named { name, item: User { user } }],
    };

    serde_yaml::to_string(&doc).map_err(|e| BrokerError::Internal(anyhow::anyhow!("kubeconfig encoding failed: {}", e)))
}

/// `ExecCredential` as printed by an exec plugin.
pub fn exec_credential(token: &str, expires_at: DateTime<Utc>) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": EXEC_API_VERSION,
        "kind": "ExecCredential",
        "status": {
            "token": token,
            "expirationTimestamp": expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base() -> KubernetesCredentialConfig {
        KubernetesCredentialConfig {
            cluster_name: "prod".into(),
            api_server: "https://k8s.example.com:6443".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_validation_per_method() {
        let mut cfg = base();
        cfg.auth_method = "token".into();
        assert!(validate_config(&cfg).is_err());
        cfg.token = "sa-token".into();
        assert!(validate_config(&cfg).is_ok());

        let mut eks = base();
        eks.auth_method = "aws-eks".into();
        eks.aws_cluster_name = "c".into();
        assert!(validate_config(&eks).is_err());
        eks.aws_region = "eu-west-1".into();
        assert!(validate_config(&eks).is_ok());

        let mut exec_cfg = base();
        exec_cfg.auth_method = "exec".into();
        assert!(validate_config(&exec_cfg).is_ok());

        let mut missing_server = exec_cfg.clone();
        missing_server.api_server.clear();
        assert!(matches!(validate_config(&missing_server), Err(BrokerError::Validation(_))));
    }

    #[test]
    fn test_unsupported_method_is_config_error() {
        let mut cfg = base();
        cfg.auth_method = "oidc".into();
        assert!(matches!(validate_config(&cfg), Err(BrokerError::Config(_))));
    }

    #[test]
    fn test_token_kubeconfig_skips_tls_without_ca() {
        let mut cfg = base();
        cfg.token = "sa-token".into();
        cfg.namespace = "agents".into();
        let yaml = kubeconfig(&cfg, AuthMethod::Token, "S1").unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(doc["current-context"].as_str(), Some("prod"));
        assert_eq!(doc["clusters"][0]["cluster"]["insecure-skip-tls-verify"].as_bool(), Some(true));
        assert_eq!(doc["contexts"][0]["context"]["namespace"].as_str(), Some("agents"));
        assert_eq!(doc["users"][0]["user"]["token"].as_str(), Some("sa-token"));
    }

    #[test]
    fn test_ca_is_base64_embedded() {
        let mut cfg = base();
        cfg.ca_cert_pem = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n".into();
        let yaml = kubeconfig(&cfg, AuthMethod::Exec, "S1").unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let encoded = doc["clusters"][0]["cluster"]["certificate-authority-data"].as_str().unwrap();
        assert_eq!(STANDARD.decode(encoded).unwrap(), cfg.ca_cert_pem.as_bytes());
        assert!(doc["clusters"][0]["cluster"].get("insecure-skip-tls-verify").is_none());
    }

    #[test]
    fn test_exec_stanza_calls_helper_with_sandbox() {
        let yaml = kubeconfig(&base(), AuthMethod::Exec, "S1").unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let exec = &doc["users"][0]["user"]["exec"];
        assert_eq!(exec["apiVersion"].as_str(), Some(EXEC_API_VERSION));
        assert_eq!(exec["command"].as_str(), Some(HELPER_PATH));
        assert_eq!(exec["args"][1].as_str(), Some("S1"));
        assert_eq!(doc["contexts"][0]["context"]["namespace"].as_str(), Some("default"));
    }

    #[test]
    fn test_eks_stanza_delegates_to_aws_cli() {
        let mut cfg = base();
        cfg.aws_cluster_name = "eks-prod".into();
        cfg.aws_region = "eu-west-1".into();
        let yaml = kubeconfig(&cfg, AuthMethod::AwsEks, "S1").unwrap();
        assert!(yaml.contains("command: aws"));
        assert!(yaml.contains("eks-prod"));
        assert!(yaml.contains("eu-west-1"));
    }

    #[test]
    fn test_exec_credential_shape() {
        let at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let cred = exec_credential("tok", at);
        assert_eq!(cred["kind"], "ExecCredential");
        assert_eq!(cred["apiVersion"], EXEC_API_VERSION);
        assert_eq!(cred["status"]["token"], "tok");
        assert_eq!(cred["status"]["expirationTimestamp"], "2030-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn test_exchange_for_cloud_method_carries_no_token() {
        let mut cfg = base();
        cfg.auth_method = "gcp-gke".into();
        cfg.gcp_project = "p".into();
        cfg.gcp_cluster = "c".into();
        cfg.gcp_zone = "z".into();
        let cred = KubernetesAdapter::new()
            .exchange(&CredentialConfig::Kubernetes(cfg), "S1")
            .await
            .unwrap();
        match cred {
            EphemeralCredential::Kubernetes(k) => {
                assert!(k.token.is_none());
                assert!(k.exec_credential.is_none());
                assert!(k.kubeconfig.contains("gke-gcloud-auth-plugin"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
