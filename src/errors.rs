//! Crate-wide error type and its HTTP mapping.
//!
//! Consumers additionally classify errors as retryable (delivery is
//! nacked and redelivered) or not (delivery is acked and dead-lettered).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use thiserror::Error;

use crate::cache::KvError;
use crate::message_bus::BusError;
use crate::message_log::LogError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Idempotency-Key header is required")]
    MissingIdempotencyKey,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("entry would drive balance negative: {0}")]
    NegativeBalance(String),

    #[error("database error: {0}")]
    Database(#[from] DbErr),

    #[error("cache error: {0}")]
    Cache(#[from] KvError),

    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("bus error: {0}")]
    Bus(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Whether a consumer should redeliver the triggering message.
    ///
    /// Upstream failures (store, cache, log, bus) are transient: the
    /// offset is not advanced and the delivery retries. Validation and
    /// conflict failures are deterministic: retrying cannot help, the
    /// delivery is acked and dead-lettered.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Database(_)
                | ServiceError::Cache(_)
                | ServiceError::Log(_)
                | ServiceError::Bus(_)
                | ServiceError::Internal(_)
        )
    }
}

impl From<BusError> for ServiceError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Timeout => ServiceError::Timeout("bus request timed out".to_string()),
            other => ServiceError::Bus(other.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::Validation(err.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServiceError::MissingIdempotencyKey => (StatusCode::BAD_REQUEST, self.to_string()),
            ServiceError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ServiceError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ServiceError::Conflict(msg) | ServiceError::Duplicate(msg) => {
                (StatusCode::CONFLICT, msg.clone())
            }
            ServiceError::NegativeBalance(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            ServiceError::Database(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "database error".to_string())
            }
            ServiceError::Cache(_) | ServiceError::Log(_) | ServiceError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            ServiceError::Bus(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            ServiceError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg.clone()),
            ServiceError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(serde_json::json!({ "error": message }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_errors_are_retryable() {
        assert!(ServiceError::Database(DbErr::Custom("down".into())).is_retryable());
        assert!(ServiceError::Bus("broker gone".into()).is_retryable());
        assert!(ServiceError::Internal("panic adjacent".into()).is_retryable());
    }

    #[test]
    fn deterministic_errors_are_not_retryable() {
        assert!(!ServiceError::Validation("bad amount".into()).is_retryable());
        assert!(!ServiceError::Conflict("already advanced".into()).is_retryable());
        assert!(!ServiceError::Timeout("fraud reply".into()).is_retryable());
        assert!(!ServiceError::NegativeBalance("acct".into()).is_retryable());
    }
}
