use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("{0}")]
    NotFound(String),

    #[error("unsupported billing provider: {0}")]
    UnsupportedProvider(String),

    #[error("malformed receipt: {0}")]
    MalformedReceipt(String),

    #[error("receipt rejected by provider: {0}")]
    ReceiptRejected(String),

    #[error("receipt verification failed: {0}")]
    Verification(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    BadRequest(String),
}

impl SubscriptionError {
    /// Whether retrying the whole operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SubscriptionError::Store(_)
                | SubscriptionError::Timeout(..)
                | SubscriptionError::Conflict(_)
                | SubscriptionError::Verification(_)
        )
    }

    fn category(&self) -> &'static str {
        match self {
            SubscriptionError::NotFound(_) => "Not found",
            SubscriptionError::UnsupportedProvider(_) => "Unsupported provider",
            SubscriptionError::MalformedReceipt(_) => "Malformed receipt",
            SubscriptionError::ReceiptRejected(_) => "Receipt rejected",
            SubscriptionError::Verification(_) => "Receipt verification error",
            SubscriptionError::Store(_) => "Database error",
            SubscriptionError::Timeout(..) => "Timeout",
            SubscriptionError::Conflict(_) => "Conflict",
            SubscriptionError::Unauthorized(_) => "Unauthorized",
            SubscriptionError::BadRequest(_) => "Bad request",
        }
    }
}

impl ResponseError for SubscriptionError {
    fn status_code(&self) -> StatusCode {
        match self {
            SubscriptionError::NotFound(_) => StatusCode::NOT_FOUND,
            SubscriptionError::UnsupportedProvider(_)
            | SubscriptionError::MalformedReceipt(_)
            | SubscriptionError::ReceiptRejected(_)
            | SubscriptionError::BadRequest(_) => StatusCode::BAD_REQUEST,
            SubscriptionError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            SubscriptionError::Conflict(_) => StatusCode::CONFLICT,
            SubscriptionError::Verification(_) => StatusCode::BAD_GATEWAY,
            SubscriptionError::Timeout(..) => StatusCode::GATEWAY_TIMEOUT,
            SubscriptionError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": self.category(),
            "message": self.to_string()
        }))
    }
}

impl From<surrealdb::Error> for SubscriptionError {
    fn from(err: surrealdb::Error) -> Self {
        SubscriptionError::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            SubscriptionError::NotFound("none".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            SubscriptionError::MalformedReceipt("purchaseToken".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SubscriptionError::Timeout("store", Duration::from_secs(5)).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(SubscriptionError::Store("connection reset".into()).is_transient());
        assert!(SubscriptionError::Conflict("active row exists".into()).is_transient());
        assert!(!SubscriptionError::UnsupportedProvider("paypal".into()).is_transient());
        assert!(!SubscriptionError::NotFound("none".into()).is_transient());
    }
}
