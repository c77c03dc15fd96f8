use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// User-facing messages. Kept generic so responses never reveal which check failed.
pub mod msg {
    pub const LINK_UNAVAILABLE: &str = "This download link is invalid or no longer available.";
    pub const LINK_EXPIRED: &str =
        "This download link has expired or reached its download limit. Please request a new link.";
    pub const ARCHIVE_PREPARING: &str =
        "Your download is being prepared. Please try again in a few minutes.";
    pub const GENERIC_FAILURE: &str = "Something went wrong. Please try again later.";

    pub const MISSING_SIGNATURE: &str = "Missing signature header";
    pub const INVALID_SIGNATURE_HEADER: &str = "Invalid signature header";
    pub const INVALID_SIGNATURE: &str = "Invalid signature";
    pub const INVALID_PAYLOAD: &str = "Invalid webhook payload";
    pub const UNSUPPORTED_GATEWAY: &str = "Unsupported payment gateway";

    pub const ORDER_NOT_FOUND: &str = "Order not found";
    pub const EMPTY_ORDER: &str = "An order must contain at least one item";
    pub const MIXED_SELLERS: &str = "All items in an order must be from the same photographer";
    pub const INVALID_ITEM: &str = "Order items must have a positive price and quantity";
    pub const ORDER_NOT_PAYABLE: &str = "Order is not awaiting payment";
    pub const PAYMENT_VERIFICATION_FAILED: &str = "Payment verification failed";
    pub const PAYMENT_PROVIDER_ERROR: &str = "Payment provider error";
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unprocessable: {0}")]
    Unprocessable(String),

    #[error("Gateway error: {0}")]
    BadGateway(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "Not found", Some(msg.clone())),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "Bad request", Some(msg.clone())),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized", None),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "Forbidden", Some(msg.clone())),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "Conflict", Some(msg.clone())),
            AppError::Unprocessable(msg) => {
                // Integrity failures are logged with full context at the call site;
                // the client only learns that verification failed.
                tracing::warn!("Unprocessable request: {}", msg);
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "Unprocessable",
                    Some(msg::PAYMENT_VERIFICATION_FAILED.to_string()),
                )
            }
            AppError::BadGateway(msg) => {
                tracing::error!("Gateway error: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    msg::PAYMENT_PROVIDER_ERROR,
                    None,
                )
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
            }
            AppError::Pool(e) => {
                tracing::error!("Pool error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
            }
            AppError::Json(e) => {
                tracing::error!("JSON error: {}", e);
                (StatusCode::BAD_REQUEST, "Invalid JSON", Some(e.to_string()))
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", None)
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
