//! Credential-helper programs and config files dropped into a sandbox.
//!
//! Every helper calls back to the broker with the sandbox's short-lived
//! session token and prints whatever the consuming tool expects. None of
//! them embeds a long-lived secret.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::ProviderType;

pub const AWS_HELPER_PATH: &str = "/usr/local/bin/aws-credential-helper";
pub const GCP_HELPER_PATH: &str = "/usr/local/bin/gcp-credential-helper";
pub const GCP_TOKEN_HELPER_PATH: &str = "/usr/local/bin/gcp-access-token";
pub const K8S_HELPER_PATH: &str = super::kubernetes::HELPER_PATH;
pub const OCI_HELPER_PATH: &str = "/usr/local/bin/oci-credential-helper";
pub const GCP_EXTERNAL_ACCOUNT_PATH: &str = "~/.config/gcloud/external_account.json";
pub const JWT_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:jwt";
const GCP_EXECUTABLE_TIMEOUT_MILLIS: u64 = 5000;

/// `sh`-safe single-quoted literal.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn env_helper_path(provider: ProviderType) -> String {
    format!("/usr/local/bin/{}-credential-helper", provider.as_str())
}

/// Common preamble: backend coordinates plus a `fetch` function that POSTs
/// the credential request and fails on an `error` field.
fn bash_preamble(title: &str, backend_url: &str, session_token: &str, sandbox_id: &str, provider: ProviderType) -> String {
    format!(
        r#"#!/bin/bash
# {title}
set -euo pipefail

BACKEND_URL={backend}
SESSION_TOKEN={token}
SANDBOX_ID={sandbox}

fetch() {{
  local response error
  response=$(curl -sS -X POST "${{BACKEND_URL}}/api/cloud/{provider}/credentials" \
    -H "Authorization: Bearer ${{SESSION_TOKEN}}" \
    -H "Content-Type: application/json" \
    -d "{{\"sandboxId\": \"${{SANDBOX_ID}}\", \"provider\": \"{provider}\"}}")
  error=$(echo "$response" | jq -r '.error // empty')
  if [ -n "$error" ]; then
    echo "Error: $error" >&2
    exit 1
  fi
  echo "$response"
}}
"#,
        title = title,
        backend = shell_quote(backend_url),
        token = shell_quote(session_token),
        sandbox = shell_quote(sandbox_id),
        provider = provider.as_str(),
    )
}

// ── AWS ──────────────────────────────────────────────────────

/// `credential_process` program printing the `Version: 1` document.
pub fn aws_credential_helper(backend_url: &str, session_token: &str, sandbox_id: &str) -> String {
    let mut script = bash_preamble(
        "AWS credential_process helper",
        backend_url,
        session_token,
        sandbox_id,
        ProviderType::Aws,
    );
    script.push_str(
        r#"
fetch | jq -c '{Version: 1, AccessKeyId: .aws.AccessKeyId, SecretAccessKey: .aws.SecretAccessKey, SessionToken: .aws.SessionToken, Expiration: .aws.Expiration}'
"#,
    );
    script
}

/// `~/.aws/config` pointing both profiles at the helper.
pub fn aws_config(region: &str) -> String {
    let region = if region.is_empty() { super::aws::DEFAULT_REGION } else { region };
    format!(
        "[default]\n\
         credential_process = {helper}\n\
         region = {region}\n\
         \n\
         [profile sandbox]\n\
         credential_process = {helper}\n\
         region = {region}\n",
        helper = AWS_HELPER_PATH,
        region = region,
    )
}

// ── GCP ──────────────────────────────────────────────────────

/// Output of an `external_account` executable credential source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableResponse {
    pub success: bool,
    pub version: u8,
    pub token_type: String,
    pub id_token: String,
    pub expiration_time: i64,
}

impl ExecutableResponse {
    pub fn jwt(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            success: true,
            version: 1,
            token_type: JWT_TOKEN_TYPE.to_string(),
            id_token: token.into(),
            expiration_time: expires_at.timestamp(),
        }
    }
}

/// Executable credential source: asks the broker for a fresh subject token
/// and prints it as-is.
pub fn gcp_executable_helper(backend_url: &str, session_token: &str, sandbox_id: &str) -> String {
    format!(
        r#"#!/bin/bash
# GCP external_account executable credential source
set -euo pipefail

BACKEND_URL={backend}
SESSION_TOKEN={token}
SANDBOX_ID={sandbox}

curl -sS --fail-with-body -X POST "${{BACKEND_URL}}/api/cloud/gcp/subject-token" \
  -H "Authorization: Bearer ${{SESSION_TOKEN}}" \
  -H "Content-Type: application/json" \
  -d "{{\"sandboxId\": \"${{SANDBOX_ID}}\"}}"
"#,
        backend = shell_quote(backend_url),
        token = shell_quote(session_token),
        sandbox = shell_quote(sandbox_id),
    )
}

/// Prints a brokered OAuth2 access token, for `gcloud --access-token-file`
/// style consumers.
pub fn gcp_access_token_helper(backend_url: &str, session_token: &str, sandbox_id: &str) -> String {
    let mut script = bash_preamble(
        "GCP access-token helper",
        backend_url,
        session_token,
        sandbox_id,
        ProviderType::Gcp,
    );
    script.push_str("\nfetch | jq -r '.gcp.access_token'\n");
    script
}

/// `external_account` credentials file driving [`gcp_executable_helper`].
pub fn gcp_external_account(audience: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "external_account",
        "audience": audience,
        "subject_token_type": JWT_TOKEN_TYPE,
        "token_url": super::gcp::STS_ENDPOINT,
        "credential_source": {
            "executable": {
                "command": GCP_HELPER_PATH,
                "timeout_millis": GCP_EXECUTABLE_TIMEOUT_MILLIS,
            }
        }
    })
}

// ── Kubernetes ───────────────────────────────────────────────

/// Exec plugin printing the broker-built `ExecCredential`.
pub fn k8s_credential_helper(backend_url: &str, session_token: &str, sandbox_id: &str) -> String {
    let mut script = bash_preamble(
        "Kubernetes exec credential plugin",
        backend_url,
        session_token,
        sandbox_id,
        ProviderType::Kubernetes,
    );
    script.push_str(
        r#"
while [[ $# -gt 0 ]]; do
  case $1 in
    --sandbox-id) SANDBOX_ID="$2"; shift 2;;
    *) shift;;
  esac
done

credential=$(fetch | jq -c '.kubernetes.exec_credential // empty')
if [ -z "$credential" ]; then
  echo "Error: no token available for this cluster" >&2
  exit 1
fi
echo "$credential"
"#,
    );
    script
}

/// Writes `~/.kube/config` from the broker's kubeconfig.
pub fn kubectl_setup(backend_url: &str, session_token: &str, sandbox_id: &str) -> String {
    let mut script = bash_preamble("kubectl setup", backend_url, session_token, sandbox_id, ProviderType::Kubernetes);
    script.push_str(
        r#"
mkdir -p "$HOME/.kube"
fetch | jq -r '.kubernetes.kubeconfig' > "$HOME/.kube/config"
chmod 600 "$HOME/.kube/config"
"#,
    );
    script
}

// ── OCI ──────────────────────────────────────────────────────

/// Lays out `~/.oci/sessions/<profile>/{token,oci_api_key.pem}` and the
/// `~/.oci/config` profile that references them.
pub fn oci_credential_helper(backend_url: &str, session_token: &str, sandbox_id: &str, profile: &str) -> String {
    let profile = if profile.is_empty() { super::oracle::DEFAULT_PROFILE } else { profile };
    let mut script = bash_preamble("OCI session helper", backend_url, session_token, sandbox_id, ProviderType::Oracle);
    script.push_str(&format!(
        r#"
PROFILE={profile}
SESSION_DIR="$HOME/.oci/sessions/$PROFILE"
response=$(fetch)

mkdir -p "$SESSION_DIR"
echo "$response" | jq -r '.oracle.token' > "$SESSION_DIR/token"
echo "$response" | jq -r '.oracle.private_key' > "$SESSION_DIR/oci_api_key.pem"
chmod 600 "$SESSION_DIR/token" "$SESSION_DIR/oci_api_key.pem"
region=$(echo "$response" | jq -r '.oracle.region')

cat > "$HOME/.oci/config" << EOF
[$PROFILE]
region=$region
security_token_file=$SESSION_DIR/token
key_file=$SESSION_DIR/oci_api_key.pem
EOF
chmod 600 "$HOME/.oci/config"
"#,
        profile = shell_quote(profile),
    ));
    script
}

// ── env-based providers (IBM, Azure, Postgres) ───────────────

/// Prints `export NAME='value'` lines; use as `eval "$(<helper>)"`.
pub fn env_helper(provider: ProviderType, backend_url: &str, session_token: &str, sandbox_id: &str) -> String {
    let mut script = bash_preamble(
        &format!("{} environment helper", provider),
        backend_url,
        session_token,
        sandbox_id,
        provider,
    );
    script.push_str(
        r#"
fetch | jq -r '.env // {} | to_entries[] | "export \(.key)=\(.value | @sh)"'
"#,
    );
    script
}

// ── bundle ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxFile {
    pub path: String,
    pub contents: String,
    pub executable: bool,
}

impl SandboxFile {
    fn script(path: impl Into<String>, contents: String) -> Self {
        Self {
            path: path.into(),
            contents,
            executable: true,
        }
    }

    fn config(path: impl Into<String>, contents: String) -> Self {
        Self {
            path: path.into(),
            contents,
            executable: false,
        }
    }
}

/// Everything a sandbox needs to reach its user's connected providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    pub backend_url: String,
    pub session_token: String,
    pub sandbox_id: String,
    pub providers: Vec<ProviderType>,
    pub files: Vec<SandboxFile>,
    pub env: BTreeMap<String, String>,
}

/// Per-provider inputs the bundle needs beyond the session.
#[derive(Debug, Clone, Default)]
pub struct ProviderHints {
    pub aws_region: String,
    pub gcp_audience: Option<String>,
    pub oci_profile: String,
}

impl SandboxConfig {
    pub fn new(backend_url: &str, session_token: &str, sandbox_id: &str) -> Self {
        Self {
            backend_url: backend_url.to_string(),
            session_token: session_token.to_string(),
            sandbox_id: sandbox_id.to_string(),
            providers: Vec::new(),
            files: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Add the helpers and config files for one connected provider.
    pub fn add_provider(&mut self, provider: ProviderType, hints: &ProviderHints) -> Result<(), serde_json::Error> {
        let (url, token, sandbox) = (self.backend_url.clone(), self.session_token.clone(), self.sandbox_id.clone());
        match provider {
            ProviderType::Aws => {
                self.files.push(SandboxFile::script(AWS_HELPER_PATH, aws_credential_helper(&url, &token, &sandbox)));
                self.files.push(SandboxFile::config("~/.aws/config", aws_config(&hints.aws_region)));
            }
            ProviderType::Gcp => {
                self.files.push(SandboxFile::script(
                    GCP_TOKEN_HELPER_PATH,
                    gcp_access_token_helper(&url, &token, &sandbox),
                ));
                if let Some(audience) = &hints.gcp_audience {
                    self.files.push(SandboxFile::script(GCP_HELPER_PATH, gcp_executable_helper(&url, &token, &sandbox)));
                    self.files.push(SandboxFile::config(
                        GCP_EXTERNAL_ACCOUNT_PATH,
                        serde_json::to_string_pretty(&gcp_external_account(audience))?,
                    ));
                    self.env
                        .insert("GOOGLE_APPLICATION_CREDENTIALS".into(), GCP_EXTERNAL_ACCOUNT_PATH.into());
                    self.env.insert("GOOGLE_EXTERNAL_ACCOUNT_ALLOW_EXECUTABLES".into(), "1".into());
                }
            }
            ProviderType::Kubernetes => {
                self.files.push(SandboxFile::script(K8S_HELPER_PATH, k8s_credential_helper(&url, &token, &sandbox)));
                self.files.push(SandboxFile::script(
                    "/usr/local/bin/kubectl-setup",
                    kubectl_setup(&url, &token, &sandbox),
                ));
            }
            ProviderType::Oracle => {
                self.files.push(SandboxFile::script(
                    OCI_HELPER_PATH,
                    oci_credential_helper(&url, &token, &sandbox, &hints.oci_profile),
                ));
            }
            ProviderType::Ibm | ProviderType::Azure | ProviderType::Postgres => {
                self.files.push(SandboxFile::script(
                    env_helper_path(provider),
                    env_helper(provider, &url, &token, &sandbox),
                ));
            }
        }
        self.providers.push(provider);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TOKEN: &str = "eyJhbGciOiJIUzI1NiJ9.payload.sig";

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_aws_helper_calls_back_with_session_token_only() {
        let script = aws_credential_helper("https://broker.example.com", TOKEN, "S1");
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("/api/cloud/aws/credentials"));
        assert!(script.contains(&format!("SESSION_TOKEN='{}'", TOKEN)));
        assert!(script.contains("Version: 1"));
        assert!(script.contains("SecretAccessKey: .aws.SecretAccessKey"));
    }

    #[test]
    fn test_aws_config_uses_credential_process() {
        let cfg = aws_config("");
        assert!(cfg.contains("[default]\ncredential_process = /usr/local/bin/aws-credential-helper\nregion = us-east-1\n"));
        assert!(cfg.contains("[profile sandbox]"));
    }

    #[test]
    fn test_executable_response_shape() {
        let resp = ExecutableResponse::jwt("subject", Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["success"], true);
        assert_eq!(v["version"], 1);
        assert_eq!(v["token_type"], JWT_TOKEN_TYPE);
        assert_eq!(v["id_token"], "subject");
        assert_eq!(v["expiration_time"], 1_893_456_000i64);
    }

    #[test]
    fn test_external_account_points_at_executable() {
        let v = gcp_external_account("//iam.googleapis.com/locations/global/workloadIdentityPools/p/providers/q");
        assert_eq!(v["type"], "external_account");
        assert_eq!(v["subject_token_type"], JWT_TOKEN_TYPE);
        assert_eq!(v["credential_source"]["executable"]["command"], GCP_HELPER_PATH);
        assert_eq!(v["credential_source"]["executable"]["timeout_millis"], 5000);
    }

    #[test]
    fn test_bundle_contains_files_per_provider() {
        let mut bundle = SandboxConfig::new("http://b", TOKEN, "S1");
        let hints = ProviderHints {
            aws_region: "eu-west-1".into(),
            gcp_audience: Some("aud".into()),
            ..Default::default()
        };
        for p in [ProviderType::Aws, ProviderType::Gcp, ProviderType::Ibm] {
            bundle.add_provider(p, &hints).unwrap();
        }
        let paths: Vec<&str> = bundle.files.iter().map(|f| f.path.as_str()).collect();
        assert!(paths.contains(&AWS_HELPER_PATH));
        assert!(paths.contains(&"~/.aws/config"));
        assert!(paths.contains(&GCP_HELPER_PATH));
        assert!(paths.contains(&"/usr/local/bin/ibm-credential-helper"));
        assert_eq!(bundle.env["GOOGLE_APPLICATION_CREDENTIALS"], GCP_EXTERNAL_ACCOUNT_PATH);
        assert_eq!(bundle.providers, vec![ProviderType::Aws, ProviderType::Gcp, ProviderType::Ibm]);
    }

    #[test]
    fn test_oci_helper_writes_session_layout() {
        let script = oci_credential_helper("http://b", TOKEN, "S1", "");
        assert!(script.contains("PROFILE='DEFAULT'"));
        assert!(script.contains("security_token_file=$SESSION_DIR/token"));
        assert!(script.contains("key_file=$SESSION_DIR/oci_api_key.pem"));
    }
}
