/// HTTP plumbing shared by the cloud IAM adapters.
/// Uses reqwest-middleware for transient-failure retries.
use std::time::Duration;

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;

use crate::errors::{BrokerError, Result};

/// Cloud IAM calls are bounded at 30s.
pub const IAM_TIMEOUT: Duration = Duration::from_secs(30);

fn base_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("falling back to default HTTP client: {}", e);
            reqwest::Client::new()
        })
}

/// Client that retries transient failures twice.
pub fn build_client(timeout: Duration) -> ClientWithMiddleware {
    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(2);

    ClientBuilder::new(base_client(timeout))
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build()
}

/// Client that sends each request exactly once. For grants that consume
/// their input (authorization codes, rotating refresh tokens).
pub fn build_single_attempt_client(timeout: Duration) -> ClientWithMiddleware {
    ClientBuilder::new(base_client(timeout)).build()
}

/// Decode a 2xx JSON body, or turn anything else into `BrokerError::Provider`
/// carrying the upstream status and body.
pub async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(BrokerError::provider(status.as_u16(), body));
    }
    serde_json::from_str(&body).map_err(|e| {
        BrokerError::provider(status.as_u16(), format!("unexpected response ({}): {}", e, truncate(&body, 256)))
    })
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
