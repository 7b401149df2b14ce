//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use checkout::CheckoutError;
use ledger::LedgerError;
use payment::PaymentError;

/// Message returned for any redirect that fails verification. Details stay
/// in the logs.
pub const VERIFY_FAILED: &str = "payment could not be verified";

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Callback authentication failed.
    Unauthorized(String),
    /// A redirect failed verification.
    PaymentNotVerified,
    /// Processing did not finish in time; the caller may retry.
    Timeout,
    /// Reserve/confirm/release error.
    Checkout(CheckoutError),
    /// Payment gateway or provider error.
    Payment(PaymentError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Checkout(CheckoutError::InsufficientStock { shortfalls })
            | ApiError::Payment(PaymentError::Checkout(CheckoutError::InsufficientStock {
                shortfalls,
            })) => (
                StatusCode::CONFLICT,
                serde_json::json!({
                    "error": "insufficient stock",
                    "shortfalls": shortfalls,
                }),
            ),
            other => {
                let (status, message) = other.status_and_message();
                (status, serde_json::json!({ "error": message }))
            }
        };

        (status, axum::Json(body)).into_response()
    }
}

impl ApiError {
    fn status_and_message(self) -> (StatusCode, String) {
        match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::PaymentNotVerified => (StatusCode::BAD_REQUEST, VERIFY_FAILED.to_string()),
            ApiError::Timeout => (
                StatusCode::SERVICE_UNAVAILABLE,
                "processing timed out, retry later".to_string(),
            ),
            ApiError::Checkout(err) | ApiError::Payment(PaymentError::Checkout(err)) => {
                checkout_error_to_response(err)
            }
            ApiError::Payment(err) => payment_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        }
    }
}

fn checkout_error_to_response(err: CheckoutError) -> (StatusCode, String) {
    match &err {
        CheckoutError::InvalidCart(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        CheckoutError::InsufficientStock { .. } => (StatusCode::CONFLICT, err.to_string()),
        CheckoutError::UnknownCheckoutRef(_) => (StatusCode::NOT_FOUND, err.to_string()),
        CheckoutError::Ledger(LedgerError::DuplicateCheckout(_)) => {
            (StatusCode::CONFLICT, err.to_string())
        }
        _ => {
            if err.needs_operator() {
                tracing::error!(error = %err, "checkout needs reconciliation");
            } else {
                tracing::error!(error = %err, "checkout operation failed");
            }
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            )
        }
    }
}

fn payment_error_to_response(err: PaymentError) -> (StatusCode, String) {
    match &err {
        PaymentError::SignatureMismatch => (StatusCode::UNAUTHORIZED, err.to_string()),
        PaymentError::MalformedCallback(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        PaymentError::Provider(_) => {
            tracing::error!(error = %err, "payment provider failed");
            (StatusCode::BAD_GATEWAY, err.to_string())
        }
        _ => {
            tracing::error!(error = %err, "payment processing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            )
        }
    }
}

impl From<CheckoutError> for ApiError {
    fn from(err: CheckoutError) -> Self {
        ApiError::Checkout(err)
    }
}

impl From<PaymentError> for ApiError {
    fn from(err: PaymentError) -> Self {
        ApiError::Payment(err)
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError::Checkout(CheckoutError::Ledger(err))
    }
}
