//! Payment gateway port. Settlement, checkout and refunds talk to the gateway only
//! through `PaymentGateway`; `StripeGateway` is the production adapter.

mod stripe;

pub use stripe::*;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use strum::{AsRefStr, Display};
use thiserror::Error;

use crate::error::AppError;
use crate::models::TransactionStatus;

/// Lifecycle of a gateway payment intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    RequiresCapture,
    Processing,
    Succeeded,
    Canceled,
    Unknown,
}

impl IntentStatus {
    pub fn from_gateway(status: &str) -> Self {
        match status {
            "requires_payment_method" => Self::RequiresPaymentMethod,
            "requires_confirmation" => Self::RequiresConfirmation,
            "requires_action" => Self::RequiresAction,
            "requires_capture" => Self::RequiresCapture,
            "processing" => Self::Processing,
            "succeeded" => Self::Succeeded,
            "canceled" => Self::Canceled,
            _ => Self::Unknown,
        }
    }

    /// Transaction status recorded for an intent in this state.
    pub fn transaction_status(&self) -> TransactionStatus {
        match self {
            Self::Succeeded => TransactionStatus::Completed,
            Self::Processing => TransactionStatus::Processing,
            Self::RequiresPaymentMethod
            | Self::RequiresConfirmation
            | Self::RequiresAction
            | Self::RequiresCapture => TransactionStatus::Pending,
            Self::Canceled => TransactionStatus::Cancelled,
            Self::Unknown => TransactionStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChargeDetails {
    pub id: String,
    pub receipt_url: Option<String>,
    pub payment_method: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentIntent {
    pub id: String,
    pub status: IntentStatus,
    /// Amount the intent was created for, in minor units
    pub amount: i64,
    /// Amount actually captured; may differ from `amount`
    pub amount_received: i64,
    pub currency: String,
    pub client_secret: Option<String>,
    pub latest_charge: Option<ChargeDetails>,
    pub metadata: HashMap<String, String>,
    pub next_action: Option<serde_json::Value>,
}

impl PaymentIntent {
    /// The amount an order must match: captured once succeeded, intended before.
    pub fn captured_or_intended(&self) -> i64 {
        if self.status == IntentStatus::Succeeded {
            self.amount_received
        } else {
            self.amount
        }
    }

    /// Charge metadata merged into the transaction row on settlement.
    pub fn charge_metadata(&self) -> serde_json::Value {
        let mut meta = serde_json::Map::new();
        meta.insert("intent_status".into(), self.status.as_ref().into());
        if let Some(charge) = &self.latest_charge {
            meta.insert("charge_id".into(), charge.id.clone().into());
            if let Some(url) = &charge.receipt_url {
                meta.insert("receipt_url".into(), url.clone().into());
            }
            if let Some(pm) = &charge.payment_method {
                meta.insert("payment_method".into(), pm.clone().into());
            }
        }
        serde_json::Value::Object(meta)
    }
}

#[derive(Debug, Clone)]
pub struct IntentRequest {
    pub amount: i64,
    pub currency: String,
    pub idempotency_key: String,
    pub metadata: HashMap<String, String>,
    pub description: Option<String>,
    pub receipt_email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub charge_id: String,
    pub amount: i64,
    /// One key per logical refund; retries of that refund reuse it
    pub idempotency_key: String,
    pub reason: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefundReceipt {
    pub id: String,
    pub status: String,
    pub amount: i64,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The call timed out. The outcome is unknown and must be re-checked.
    #[error("gateway request timed out")]
    Timeout,

    #[error("gateway transport error: {0}")]
    Transport(String),

    #[error("gateway rate limited the request")]
    RateLimited,

    #[error("gateway server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Declined or invalid request; retrying will not help.
    #[error("gateway rejected the request: {0}")]
    Rejected(String),

    #[error("unexpected gateway response: {0}")]
    Decode(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Transport(_) | Self::RateLimited | Self::Server { .. }
        )
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Rejected(message) => AppError::BadRequest(message),
            other => AppError::BadGateway(other.to_string()),
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Gateway identifier stored on transactions (e.g. "stripe").
    fn name(&self) -> &'static str;

    async fn create_intent(&self, request: IntentRequest) -> Result<PaymentIntent, GatewayError>;

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError>;

    async fn confirm_intent(
        &self,
        intent_id: &str,
        payment_method: Option<&str>,
    ) -> Result<PaymentIntent, GatewayError>;

    async fn refund(&self, request: RefundRequest) -> Result<RefundReceipt, GatewayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("webhook secret is not configured")]
    NotConfigured,

    #[error("signature header is malformed")]
    Malformed,

    #[error("signature timestamp outside tolerance")]
    Stale,

    #[error("signature does not match")]
    Mismatch,
}
