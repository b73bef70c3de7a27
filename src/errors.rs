use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;
use crate::vault::crypto::CryptoError;

/// Failures of the issue/validate operations. Validation rejections
/// (not found, expired, device conflict) are not errors; see
/// [`crate::tokens::validator::ValidationOutcome`].
#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed or missing caller data; the payload names the field.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("token already exists")]
    DuplicateToken,

    #[error("no unique token after {attempts} attempts")]
    GenerationExhausted { attempts: u32 },

    #[error("transaction exceeded {0:?}")]
    TransactionTimeout(std::time::Duration),

    #[error("storage error: {0}")]
    Storage(StoreError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate => AppError::DuplicateToken,
            other => AppError::Storage(other),
        }
    }
}

impl AppError {
    /// Stable machine-readable code, also used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "invalid_input",
            AppError::DuplicateToken => "duplicate_token",
            AppError::GenerationExhausted { .. } => "generation_exhausted",
            AppError::TransactionTimeout(_)
            | AppError::Storage(_)
            | AppError::Crypto(_)
            | AppError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, error_type, msg) = match &self {
            AppError::InvalidInput(field) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                format!("invalid or missing field '{}'", field),
            ),
            AppError::DuplicateToken => (
                StatusCode::CONFLICT,
                "invalid_request_error",
                "token already in use, choose another".to_string(),
            ),
            AppError::GenerationExhausted { .. } => {
                tracing::error!("{}", self);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "internal_error",
                    "could not generate a unique token, retry later".to_string(),
                )
            }
            AppError::TransactionTimeout(_)
            | AppError::Storage(_)
            | AppError::Crypto(_)
            | AppError::Internal(_) => {
                tracing::error!("Internal error: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_store_error_maps_to_duplicate_token() {
        assert!(matches!(
            AppError::from(StoreError::Duplicate),
            AppError::DuplicateToken
        ));
        assert!(matches!(
            AppError::from(StoreError::Finished),
            AppError::Storage(_)
        ));
    }

    #[test]
    fn test_status_codes() {
        let cases = [
            (AppError::InvalidInput("owner"), StatusCode::BAD_REQUEST),
            (AppError::DuplicateToken, StatusCode::CONFLICT),
            (
                AppError::GenerationExhausted { attempts: 8 },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                AppError::Storage(StoreError::Database(sqlx::Error::PoolTimedOut)),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
