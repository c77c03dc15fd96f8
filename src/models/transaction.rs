use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{AsRefStr, Display, EnumString};

/// Status of a gateway payment attempt.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Refunded,
    PartiallyRefunded,
}

impl TransactionStatus {
    /// Money was captured for this transaction (possibly refunded since).
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallyRefunded | Self::Refunded
        )
    }

    pub fn is_refundable(&self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyRefunded)
    }

    /// Still waiting on the gateway.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

/// One payment attempt against the gateway. At most one row per gateway intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub order_id: i64,
    pub gateway: String,
    pub gateway_transaction_id: String,
    pub amount_cents: i64,
    pub refunded_cents: i64,
    pub currency: String,
    pub status: TransactionStatus,
    /// Gateway data: charge_id, receipt_url, payment_method, failure_reason, refunds
    pub metadata: Value,
    pub processed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Transaction {
    pub fn charge_id(&self) -> Option<&str> {
        self.metadata.get("charge_id").and_then(Value::as_str)
    }

    pub fn receipt_url(&self) -> Option<&str> {
        self.metadata.get("receipt_url").and_then(Value::as_str)
    }

    pub fn remaining_cents(&self) -> i64 {
        (self.amount_cents - self.refunded_cents).max(0)
    }

    /// Whether a gateway refund id has already been applied to this transaction.
    pub fn has_refund(&self, refund_id: &str) -> bool {
        self.metadata
            .get("refunds")
            .and_then(Value::as_array)
            .is_some_and(|refunds| {
                refunds
                    .iter()
                    .any(|r| r.get("id").and_then(Value::as_str) == Some(refund_id))
            })
    }
}

/// Data required to create a new transaction
#[derive(Debug, Clone)]
pub struct CreateTransaction {
    pub order_id: i64,
    pub gateway: String,
    pub gateway_transaction_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: TransactionStatus,
    pub metadata: Value,
    pub processed_at: Option<i64>,
}

/// Shallow-merge `patch` into `base`. Non-object values are replaced wholesale.
pub fn merge_metadata(base: &Value, patch: Value) -> Value {
    let mut merged = match base {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    match patch {
        Value::Object(patch) => {
            for (key, value) in patch {
                merged.insert(key, value);
            }
        }
        Value::Null => {}
        other => return other,
    }
    Value::Object(merged)
}
