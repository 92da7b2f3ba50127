use std::fmt;

use chrono::Utc;
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::errors::{AuthError, BrokerError, Result};

pub const ISSUER: &str = "credential-broker";

/// Permission a session token may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    #[serde(rename = "mcp:list_tools")]
    ListTools,
    #[serde(rename = "mcp:call_tools")]
    CallTools,
    #[serde(rename = "mcp:list_apps")]
    ListApps,
    /// Satisfies every single-scope check.
    #[serde(rename = "mcp:*")]
    All,
    /// Subject token for GCP workload-identity federation.
    #[serde(rename = "cloud:gcp:token")]
    GcpToken,
    /// Sandbox fetch of ephemeral cloud credentials.
    #[serde(rename = "cloud:credentials")]
    CloudCredentials,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::ListTools => "mcp:list_tools",
            Scope::CallTools => "mcp:call_tools",
            Scope::ListApps => "mcp:list_apps",
            Scope::All => "mcp:*",
            Scope::GcpToken => "cloud:gcp:token",
            Scope::CloudCredentials => "cloud:credentials",
        }
    }

    pub fn parse(s: &str) -> Option<Scope> {
        match s {
            "mcp:list_tools" => Some(Scope::ListTools),
            "mcp:call_tools" => Some(Scope::CallTools),
            "mcp:list_apps" => Some(Scope::ListApps),
            "mcp:*" => Some(Scope::All),
            "cloud:gcp:token" => Some(Scope::GcpToken),
            "cloud:credentials" => Some(Scope::CloudCredentials),
            _ => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub user_id: String,
    pub conversation_id: String,
    pub sandbox_id: String,
    pub scopes: Vec<Scope>,
    /// 16 random bytes, hex. Unique per token.
    pub nonce: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub iss: String,
    pub sub: String,
}

impl SessionClaims {
    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.iter().any(|s| *s == Scope::All || *s == scope)
    }

    pub fn require(&self, scope: Scope) -> std::result::Result<(), AuthError> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(AuthError::MissingScope(scope.to_string()))
        }
    }
}

/// Mints and validates HS256 session tokens. Stateless: there is no
/// revocation, a leaked token is usable until `exp`.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    default_ttl_secs: i64,
    max_ttl_secs: i64,
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("default_ttl_secs", &self.default_ttl_secs)
            .field("max_ttl_secs", &self.max_ttl_secs)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    pub fn new(secret: &str, default_ttl_secs: u64, max_ttl_secs: u64) -> Self {
        let max_ttl_secs = max_ttl_secs.max(1) as i64;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            default_ttl_secs: (default_ttl_secs as i64).clamp(1, max_ttl_secs),
            max_ttl_secs,
        }
    }

    pub fn default_ttl_secs(&self) -> i64 {
        self.default_ttl_secs
    }

    pub fn issue(
        &self,
        user_id: &str,
        conversation_id: &str,
        sandbox_id: &str,
        scopes: &[Scope],
    ) -> Result<String> {
        self.issue_with_ttl(user_id, conversation_id, sandbox_id, scopes, self.default_ttl_secs)
    }

    /// Requested TTL is capped at the configured maximum.
    pub fn issue_with_ttl(
        &self,
        user_id: &str,
        conversation_id: &str,
        sandbox_id: &str,
        scopes: &[Scope],
        ttl_secs: i64,
    ) -> Result<String> {
        self.issue_at(user_id, conversation_id, sandbox_id, scopes, ttl_secs, Utc::now().timestamp())
    }

    /// Issue against an explicit clock.
    pub fn issue_at(
        &self,
        user_id: &str,
        conversation_id: &str,
        sandbox_id: &str,
        scopes: &[Scope],
        ttl_secs: i64,
        now: i64,
    ) -> Result<String> {
        if user_id.is_empty() {
            return Err(BrokerError::validation("user ID is required"));
        }
        let ttl = ttl_secs.clamp(1, self.max_ttl_secs);
        let claims = SessionClaims {
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            sandbox_id: sandbox_id.to_string(),
            scopes: scopes.to_vec(),
            nonce: generate_nonce(),
            iat: now,
            nbf: now,
            exp: now + ttl,
            iss: ISSUER.to_string(),
            sub: user_id.to_string(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("token signing failed: {}", e)))
    }

    pub fn validate(&self, token: &str) -> std::result::Result<SessionClaims, AuthError> {
        self.validate_at(token, Utc::now().timestamp())
    }

    pub fn validate_with_scope(
        &self,
        token: &str,
        scope: Scope,
    ) -> std::result::Result<SessionClaims, AuthError> {
        let claims = self.validate(token)?;
        claims.require(scope)?;
        Ok(claims)
    }

    /// Validation against an explicit clock, no leeway.
    pub fn validate_at(&self, token: &str, now: i64) -> std::result::Result<SessionClaims, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::MissingToken);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.leeway = 0;
        validation.required_spec_claims.clear();
        validation.set_issuer(&[ISSUER]);

        let data = decode::<SessionClaims>(token, &self.decoding, &validation).map_err(|e| match e.kind() {
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => AuthError::BadSignature,
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::Malformed,
        })?;

        let claims = data.claims;
        if now >= claims.exp {
            return Err(AuthError::Expired);
        }
        if now < claims.nbf {
            return Err(AuthError::Malformed);
        }
        Ok(claims)
    }

    /// Re-issue a still-valid token with a fresh nonce and expiry.
    pub fn refresh(&self, token: &str) -> Result<String> {
        let claims = self.validate(token)?;
        self.issue(&claims.user_id, &claims.conversation_id, &claims.sandbox_id, &claims.scopes)
    }
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new("test-secret", 300, 3600)
    }

    #[test]
    fn test_issue_and_validate() {
        let issuer = issuer();
        let token = issuer.issue("user1", "conv1", "S1", &[Scope::ListTools]).unwrap();
        let claims = issuer.validate(&token).unwrap();
        assert_eq!(claims.user_id, "user1");
        assert_eq!(claims.sub, "user1");
        assert_eq!(claims.conversation_id, "conv1");
        assert_eq!(claims.sandbox_id, "S1");
        assert_eq!(claims.iss, ISSUER);
        assert_eq!(claims.exp - claims.iat, 300);
        assert_eq!(claims.nonce.len(), 32);
    }

    #[test]
    fn test_expiry_boundary() {
        let issuer = issuer();
        let t0 = 1_700_000_000;
        let token = issuer
            .issue_at("user1", "c", "S1", &[Scope::All], 300, t0)
            .unwrap();
        assert!(issuer.validate_at(&token, t0 + 299).is_ok());
        assert_eq!(issuer.validate_at(&token, t0 + 301), Err(AuthError::Expired));
    }

    #[test]
    fn test_ttl_capped_at_max() {
        let issuer = issuer();
        let token = issuer
            .issue_with_ttl("user1", "c", "S1", &[Scope::All], 86_400)
            .unwrap();
        let claims = issuer.validate(&token).unwrap();
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn test_default_ttl_never_exceeds_max() {
        let issuer = TokenIssuer::new("s", 7200, 600);
        assert_eq!(issuer.default_ttl_secs(), 600);
    }

    #[test]
    fn test_bad_signature() {
        let token = issuer().issue("user1", "c", "S1", &[Scope::All]).unwrap();
        let other = TokenIssuer::new("other-secret", 300, 3600);
        assert_eq!(other.validate(&token), Err(AuthError::BadSignature));
    }

    #[test]
    fn test_malformed_and_missing() {
        let issuer = issuer();
        assert_eq!(issuer.validate("not-a-jwt"), Err(AuthError::Malformed));
        assert_eq!(issuer.validate(""), Err(AuthError::MissingToken));
    }

    #[test]
    fn test_scope_enforcement() {
        let issuer = issuer();
        let token = issuer.issue("user1", "c", "S1", &[Scope::ListTools]).unwrap();
        let claims = issuer.validate(&token).unwrap();
        assert!(claims.has_scope(Scope::ListTools));
        assert!(!claims.has_scope(Scope::CallTools));
        assert_eq!(
            issuer.validate_with_scope(&token, Scope::CallTools),
            Err(AuthError::MissingScope("mcp:call_tools".into()))
        );
    }

    #[test]
    fn test_all_scope_satisfies_any_check() {
        let issuer = issuer();
        let token = issuer.issue("user1", "c", "S1", &[Scope::All]).unwrap();
        let claims = issuer.validate(&token).unwrap();
        for scope in [Scope::ListTools, Scope::CallTools, Scope::ListApps, Scope::GcpToken, Scope::CloudCredentials] {
            assert!(claims.has_scope(scope));
        }
    }

    #[test]
    fn test_nonce_unique_per_token() {
        let issuer = issuer();
        let a = issuer.validate(&issuer.issue("u", "c", "s", &[Scope::All]).unwrap()).unwrap();
        let b = issuer.validate(&issuer.issue("u", "c", "s", &[Scope::All]).unwrap()).unwrap();
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn test_refresh_keeps_identity() {
        let issuer = issuer();
        let token = issuer.issue("u", "c", "s", &[Scope::ListApps]).unwrap();
        let refreshed = issuer.refresh(&token).unwrap();
        let claims = issuer.validate(&refreshed).unwrap();
        assert_eq!(claims.user_id, "u");
        assert_eq!(claims.scopes, vec![Scope::ListApps]);
    }

    #[test]
    fn test_scope_wire_names() {
        assert_eq!(serde_json::to_string(&Scope::All).unwrap(), "\"mcp:*\"");
        assert_eq!(Scope::parse("cloud:gcp:token"), Some(Scope::GcpToken));
        assert_eq!(Scope::parse("cloud:credentials"), Some(Scope::CloudCredentials));
        assert_eq!(Scope::parse("admin"), None);
    }
}
