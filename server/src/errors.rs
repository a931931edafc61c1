use axum::http::{header::HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Marker attached to error responses so the envelope middleware can patch
/// in the request path and id before the body leaves the process.
#[derive(Debug, Clone, Copy)]
pub struct ErrorEnvelope;

pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// The client-visible error taxonomy. Adapters return [`Error`]; services map
/// into this; the ingress renders the structured envelope. Stack traces and
/// SQL text never reach the wire.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    AuthRequired(String),

    #[error("{0}")]
    AuthFailed(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{message}")]
    Conflict { message: String, existing_id: i64 },

    #[error("rate limit exceeded")]
    RateLimited { limit: u32, reset_at: DateTime<Utc> },

    #[error("{0}")]
    StoreUnavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "ValidationError",
            ApiError::AuthRequired(_) => "AuthRequired",
            ApiError::AuthFailed(_) => "AuthFailed",
            ApiError::NotFound(_) => "NotFound",
            ApiError::Conflict { .. } => "Conflict",
            ApiError::RateLimited { .. } => "RateLimited",
            ApiError::StoreUnavailable(_) => "StoreUnavailable",
            ApiError::Internal(_) => "Internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::AuthRequired(_) => StatusCode::UNAUTHORIZED,
            ApiError::AuthFailed(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, ApiError::Internal(_) | ApiError::StoreUnavailable(_)) {
            error!("API error: {self}");
        }

        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
            "timestamp": Utc::now(),
        });
        if let ApiError::Conflict { existing_id, .. } = &self {
            body["existing_id"] = json!(existing_id);
            // The existing device's credential is write-once; it is never
            // echoed back on a name collision.
            body["credentials_visible"] = json!(false);
        }

        let mut response = (self.status(), Json(body)).into_response();
        if let ApiError::RateLimited { limit, reset_at } = &self {
            let headers = response.headers_mut();
            headers.insert(RATE_LIMIT_LIMIT, (*limit).into());
            headers.insert(RATE_LIMIT_REMAINING, 0.into());
            headers.insert(RATE_LIMIT_RESET, reset_at.timestamp().into());
        }
        response.extensions_mut().insert(ErrorEnvelope);
        response
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Json(e) => ApiError::Validation(format!("invalid JSON: {e}")),
            other => {
                error!("internal error: {other}");
                ApiError::Internal("an unexpected error occurred".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_status_agree_with_taxonomy() {
        let cases: Vec<(ApiError, &str, StatusCode)> = vec![
            (
                ApiError::Validation("bad".into()),
                "ValidationError",
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::AuthRequired("key".into()),
                "AuthRequired",
                StatusCode::UNAUTHORIZED,
            ),
            (
                ApiError::AuthFailed("inactive".into()),
                "AuthFailed",
                StatusCode::FORBIDDEN,
            ),
            (
                ApiError::NotFound("device".into()),
                "NotFound",
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::Conflict {
                    message: "taken".into(),
                    existing_id: 1,
                },
                "Conflict",
                StatusCode::CONFLICT,
            ),
            (
                ApiError::RateLimited {
                    limit: 100,
                    reset_at: Utc::now(),
                },
                "RateLimited",
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                ApiError::StoreUnavailable("ts down".into()),
                "StoreUnavailable",
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ApiError::Internal("boom".into()),
                "Internal",
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, kind, status) in cases {
            assert_eq!(err.kind(), kind);
            assert_eq!(err.status(), status);
        }
    }

    #[test]
    fn test_internal_detail_stays_out_of_the_envelope() {
        let api: ApiError = Error::Database(sqlx::Error::PoolClosed).into();
        assert_eq!(api.kind(), "Internal");
        assert!(!api.to_string().contains("Pool"));
    }
}
