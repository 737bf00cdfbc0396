use std::time::Duration;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Failures raised by a [`crate::store::RegistryStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("service '{0}' not found")]
    NotFound(String),

    #[error("service '{0}' already exists")]
    AlreadyExists(String),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Failures raised while ordering or applying migrations. Always fatal at boot.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration name '{0}' does not follow <ordinal>_<description>")]
    InvalidName(String),

    #[error("migrations '{first}' and '{second}' share ordinal {ordinal}")]
    DuplicateOrdinal {
        ordinal: u32,
        first: String,
        second: String,
    },

    #[error("migration ledger unavailable: {0}")]
    Ledger(#[source] StoreError),

    #[error("migration '{name}' failed: {source}")]
    Step {
        name: String,
        #[source]
        source: StoreError,
    },
}

/// Gateway-level error taxonomy surfaced to callers as `{ kind, message }`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("service '{0}' not found")]
    NotFound(String),

    #[error("call denied: {reason}")]
    Denied { service: String, reason: String },

    #[error("rate limit exceeded for '{service}'")]
    RateLimited { service: String, retry_after: Duration },

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("stream aborted: {0}")]
    StreamAborted(String),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("service '{0}' already exists")]
    AlreadyExists(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Stable machine-readable discriminator for the wire format.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) | AppError::SessionNotFound(_) => "NotFound",
            AppError::Denied { .. } => "Denied",
            AppError::RateLimited { .. } => "RateLimited",
            AppError::Upstream(_) => "UpstreamError",
            AppError::StreamAborted(_) => "StreamAborted",
            AppError::SchemaViolation(_) => "SchemaViolation",
            AppError::AlreadyExists(_) => "AlreadyExists",
            AppError::Redis(_) | AppError::Internal(_) => "Internal",
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(name) => AppError::NotFound(name),
            StoreError::AlreadyExists(name) => AppError::AlreadyExists(name),
            StoreError::SchemaViolation(msg) => AppError::SchemaViolation(msg),
            StoreError::Database(e) => AppError::Internal(e.into()),
            StoreError::Backend(e) => AppError::Internal(e),
        }
    }
}

fn retry_after_secs(retry_after: &Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) | AppError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            AppError::Denied { .. } => StatusCode::FORBIDDEN,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Upstream(_) | AppError::StreamAborted(_) => StatusCode::BAD_GATEWAY,
            AppError::SchemaViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::AlreadyExists(_) => StatusCode::CONFLICT,
            AppError::Redis(e) => {
                tracing::error!("Redis error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = match &self {
            AppError::Redis(_) | AppError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };

        let mut body = json!({
            "kind": self.kind(),
            "message": message,
        });

        let retry_after = match &self {
            AppError::RateLimited { retry_after, .. } => Some(retry_after_secs(retry_after)),
            _ => None,
        };
        if let Some(secs) = retry_after {
            body["retryAfterSecs"] = json!(secs);
        }

        let mut response = (status, Json(body)).into_response();

        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }

        response
    }
}
