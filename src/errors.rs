use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Session-token failures. Every variant fails closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("session token expired")]
    Expired,

    #[error("session token signature invalid")]
    BadSignature,

    #[error("session token malformed")]
    Malformed,

    #[error("session token missing")]
    MissingToken,

    #[error("session token lacks scope '{0}'")]
    MissingScope(String),

    #[error("sandbox ID mismatch")]
    SandboxMismatch,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("config error: {0}")]
    Config(String),

    #[error("provider error (status {status}): {body}")]
    Provider { status: u16, body: String },

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        BrokerError::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        BrokerError::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        BrokerError::NotFound(msg.into())
    }

    pub fn provider(status: u16, body: impl Into<String>) -> Self {
        BrokerError::Provider {
            status,
            body: body.into(),
        }
    }

    /// Transport-level failure talking to an upstream (no HTTP status).
    pub fn transport(err: impl std::fmt::Display) -> Self {
        BrokerError::Provider {
            status: 0,
            body: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        BrokerError::Provider {
            status: e.status().map(|s| s.as_u16()).unwrap_or(0),
            body: e.to_string(),
        }
    }
}

impl From<reqwest_middleware::Error> for BrokerError {
    fn from(e: reqwest_middleware::Error) -> Self {
        match e {
            reqwest_middleware::Error::Reqwest(inner) => inner.into(),
            other => BrokerError::transport(other),
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            BrokerError::Validation(m) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "validation_failed",
                m.clone(),
            ),
            BrokerError::Auth(AuthError::MissingScope(_)) | BrokerError::Auth(AuthError::SandboxMismatch) => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "forbidden",
                self.to_string(),
            ),
            BrokerError::Auth(e) => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                match e {
                    AuthError::Expired => "token_expired",
                    AuthError::MissingToken => "token_missing",
                    _ => "token_invalid",
                },
                e.to_string(),
            ),
            BrokerError::Config(m) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "config_error",
                "not_configured",
                m.clone(),
            ),
            BrokerError::NotFound(m) => (
                StatusCode::NOT_FOUND,
                "not_found_error",
                "not_found",
                m.clone(),
            ),
            BrokerError::Provider { status, body } => (
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                "upstream_failed",
                format!("upstream returned {}: {}", status, body),
            ),
            BrokerError::Encryption(e) => {
                tracing::error!("Encryption error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "encryption_failed",
                    "credential could not be decrypted".to_string(),
                )
            }
            BrokerError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
            BrokerError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        (status, body).into_response()
    }
}
