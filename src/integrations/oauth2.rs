use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use url::Url;

use super::OAuth2Token;
use crate::cloud::http::build_single_attempt_client;
use crate::errors::{BrokerError, Result};

const OAUTH_TIMEOUT: Duration = Duration::from_secs(20);

/// Authorization-code flow and refresh for one integration.
#[async_trait]
pub trait OAuth2Handler: Send + Sync {
    fn auth_url(&self, state: &str) -> Result<String>;

    async fn exchange_code(&self, code: &str) -> Result<OAuth2Token>;

    async fn refresh(&self, refresh_token: &str) -> Result<OAuth2Token>;
}

#[derive(Debug, Clone, Default)]
pub struct OAuth2HandlerConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_url: String,
    pub scopes: Vec<String>,
}

/// Standard form-encoded token endpoint. Grants are never retried: a
/// replayed code or rotated refresh token is rejected upstream.
pub struct GenericOAuth2Handler {
    config: OAuth2HandlerConfig,
    client: ClientWithMiddleware,
}

impl GenericOAuth2Handler {
    pub fn new(config: OAuth2HandlerConfig) -> Self {
        Self {
            config,
            client: build_single_attempt_client(OAUTH_TIMEOUT),
        }
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<OAuth2Token> {
        let resp = self
            .client
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(BrokerError::provider(status.as_u16(), body));
        }
        parse_token_response(&body)
    }
}

#[async_trait]
impl OAuth2Handler for GenericOAuth2Handler {
    fn auth_url(&self, state: &str) -> Result<String> {
        let mut url = Url::parse(&self.config.auth_url)
            .map_err(|e| BrokerError::config(format!("invalid authorization URL: {}", e)))?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("response_type", "code");
            q.append_pair("client_id", &self.config.client_id);
            q.append_pair("redirect_uri", &self.config.redirect_url);
            if !self.config.scopes.is_empty() {
                q.append_pair("scope", &self.config.scopes.join(" "));
            }
            if !state.is_empty() {
                q.append_pair("state", state);
            }
        }
        Ok(url.into())
    }

    async fn exchange_code(&self, code: &str) -> Result<OAuth2Token> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
            ("redirect_uri", &self.config.redirect_url),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<OAuth2Token> {
        if refresh_token.is_empty() {
            return Err(BrokerError::config("refresh token missing"));
        }
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
        ])
        .await
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<String>,
    #[serde(default)]
    scope: String,
}

/// Accepts `expires_in` seconds or an RFC 3339 `expires_at`, and `scope`
/// separated by spaces or commas.
pub fn parse_token_response(body: &str) -> Result<OAuth2Token> {
    let raw: TokenResponse = serde_json::from_str(body)
        .map_err(|e| BrokerError::provider(200, format!("invalid token response: {}", e)))?;
    if raw.access_token.is_empty() {
        return Err(BrokerError::provider(200, "missing access_token in response"));
    }

    let expires_at = match (raw.expires_in, raw.expires_at.as_deref()) {
        (Some(secs), _) if secs > 0 => Some(Utc::now() + chrono::Duration::seconds(secs)),
        (_, Some(at)) if !at.is_empty() => DateTime::parse_from_rfc3339(at).ok().map(|t| t.with_timezone(&Utc)),
        _ => None,
    };

    Ok(OAuth2Token {
        access_token: raw.access_token,
        refresh_token: raw.refresh_token,
        token_type: if raw.token_type.is_empty() { "Bearer".into() } else { raw.token_type },
        expires_at,
        scopes: raw
            .scope
            .split(|c: char| c == ' ' || c == ',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn handler(token_url: String) -> GenericOAuth2Handler {
        GenericOAuth2Handler::new(OAuth2HandlerConfig {
            client_id: "cid".into(),
            client_secret: "csecret".into(),
            auth_url: "https://github.com/login/oauth/authorize".into(),
            token_url,
            redirect_url: "https://broker.example.com/callback".into(),
            scopes: vec!["repo".into(), "read:org".into()],
        })
    }

    #[test]
    fn test_auth_url_carries_client_and_state() {
        let url = handler("https://example.com/token".into()).auth_url("st-1").unwrap();
        let parsed = Url::parse(&url).unwrap();
        let pairs: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["client_id"], "cid");
        assert_eq!(pairs["scope"], "repo read:org");
        assert_eq!(pairs["state"], "st-1");
    }

    #[test]
    fn test_parse_expires_in_and_comma_scopes() {
        let token =
            parse_token_response(r#"{"access_token":"a","expires_in":3600,"scope":"repo,user"}"#).unwrap();
        let remaining = (token.expires_at.unwrap() - Utc::now()).num_seconds();
        assert!((3590..=3600).contains(&remaining));
        assert_eq!(token.scopes, vec!["repo", "user"]);
        assert_eq!(token.token_type, "Bearer");
    }

    #[test]
    fn test_parse_expires_at_and_missing_expiry() {
        let token =
            parse_token_response(r#"{"access_token":"a","expires_at":"2030-01-01T00:00:00Z","scope":"a b"}"#).unwrap();
        assert_eq!(token.expires_at.unwrap().to_rfc3339(), "2030-01-01T00:00:00+00:00");
        assert_eq!(token.scopes, vec!["a", "b"]);

        assert!(parse_token_response(r#"{"access_token":"a"}"#).unwrap().expires_at.is_none());
        assert!(parse_token_response(r#"{"token_type":"bearer"}"#).is_err());
    }

    #[tokio::test]
    async fn test_refresh_posts_form_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=r1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new", "refresh_token": "r2", "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let token = handler(format!("{}/token", server.uri())).refresh("r1").await.unwrap();
        assert_eq!(token.access_token, "new");
        assert_eq!(token.refresh_token, "r2");
    }

    #[tokio::test]
    async fn test_failed_grants_are_sent_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .expect(2)
            .mount(&server)
            .await;

        let handler = handler(format!("{}/token", server.uri()));
        assert!(matches!(
            handler.refresh("rt-1").await,
            Err(BrokerError::Provider { status: 503, .. })
        ));
        assert!(matches!(
            handler.exchange_code("code-1").await,
            Err(BrokerError::Provider { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn test_rejected_code_exchange_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad_verification_code"))
            .mount(&server)
            .await;
        match handler(format!("{}/token", server.uri())).exchange_code("c").await {
            Err(BrokerError::Provider { status, body }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad_verification_code");
            }
            other => panic!("unexpected {:?}", other.map(|t| t.access_token)),
        }
    }
}
