//! Full and partial refunds against settled transactions.

use std::collections::HashMap;
use std::sync::Arc;

use backon::Retryable;
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::db::{DbPool, queries};
use crate::error::AppError;
use crate::models::{OrderStatus, Transaction, TransactionStatus, merge_metadata};
use crate::orders::{self, TransitionError};
use crate::payments::{GatewayError, PaymentGateway, RefundReceipt, RefundRequest};
use crate::util::now;

#[derive(Debug, Error)]
pub enum RefundError {
    #[error("transaction {0} not found")]
    TransactionNotFound(i64),

    #[error("order {0} has no refundable transaction")]
    NothingToRefund(i64),

    #[error("transaction is already fully refunded")]
    AlreadyRefunded,

    #[error("transaction with status {0} cannot be refunded")]
    NotRefundable(TransactionStatus),

    #[error("refund amount {requested} is invalid (paid {paid}, remaining {remaining})")]
    InvalidAmount {
        requested: i64,
        paid: i64,
        remaining: i64,
    },

    #[error("transaction has no gateway charge to refund")]
    MissingCharge,

    /// The gateway accepted the refund but the row no longer has room for it.
    #[error("refund {0} could not be recorded against the transaction")]
    Unrecorded(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Storage(#[from] AppError),
}

impl From<rusqlite::Error> for RefundError {
    fn from(e: rusqlite::Error) -> Self {
        RefundError::Storage(e.into())
    }
}

impl From<r2d2::Error> for RefundError {
    fn from(e: r2d2::Error) -> Self {
        RefundError::Storage(e.into())
    }
}

impl From<RefundError> for AppError {
    fn from(err: RefundError) -> Self {
        match err {
            RefundError::TransactionNotFound(_) | RefundError::NothingToRefund(_) => {
                AppError::NotFound(err.to_string())
            }
            RefundError::AlreadyRefunded | RefundError::NotRefundable(_) => {
                AppError::Conflict(err.to_string())
            }
            RefundError::InvalidAmount { .. } | RefundError::MissingCharge => {
                AppError::BadRequest(err.to_string())
            }
            RefundError::Unrecorded(_) => AppError::Internal(err.to_string()),
            RefundError::Gateway(e) => e.into(),
            RefundError::Transition(e) => e.into(),
            RefundError::Storage(e) => e,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Refund {
    pub refund: RefundReceipt,
    pub transaction: Transaction,
    /// Whether the order itself is now refunded
    pub order_refunded: bool,
}

/// Check a refund request against the transaction. Returns the amount to refund
/// and the charge to refund it from. Runs before any gateway call.
pub fn validate_refund(
    transaction: &Transaction,
    amount: Option<i64>,
) -> Result<(i64, String), RefundError> {
    if transaction.status == TransactionStatus::Refunded {
        return Err(RefundError::AlreadyRefunded);
    }
    if !transaction.status.is_refundable() {
        return Err(RefundError::NotRefundable(transaction.status));
    }

    let remaining = transaction.remaining_cents();
    let requested = amount.unwrap_or(remaining);
    if requested <= 0 || requested > transaction.amount_cents || requested > remaining {
        return Err(RefundError::InvalidAmount {
            requested,
            paid: transaction.amount_cents,
            remaining,
        });
    }

    let charge_id = transaction
        .charge_id()
        .ok_or(RefundError::MissingCharge)?
        .to_string();
    Ok((requested, charge_id))
}

fn with_refund_entry(metadata: &Value, refund_id: Option<&str>, amount: i64, status: &str) -> Value {
    let entry = json!({
        "id": refund_id,
        "amount": amount,
        "status": status,
        "created_at": now(),
    });
    let mut refunds = metadata
        .get("refunds")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    refunds.push(entry.clone());
    merge_metadata(metadata, json!({ "refunds": refunds, "last_refund": entry }))
}

pub struct RefundService {
    db: DbPool,
    gateway: Arc<dyn PaymentGateway>,
    retry: RetryPolicy,
}

impl RefundService {
    pub fn new(db: DbPool, gateway: Arc<dyn PaymentGateway>, retry: RetryPolicy) -> Self {
        Self { db, gateway, retry }
    }

    /// Refund `amount` (default: everything that remains) of a transaction.
    ///
    /// One idempotency key is minted per call and reused by every transient
    /// retry, so a retried network call cannot refund twice.
    pub async fn refund(
        &self,
        transaction_id: i64,
        amount: Option<i64>,
    ) -> Result<Refund, RefundError> {
        let transaction = {
            let conn = self.db.get()?;
            queries::get_transaction_by_id(&conn, transaction_id)?
                .ok_or(RefundError::TransactionNotFound(transaction_id))?
        };
        let (amount, charge_id) = validate_refund(&transaction, amount)?;

        let request = RefundRequest {
            charge_id,
            amount,
            idempotency_key: format!("refund_{}_{}", transaction.id, Uuid::new_v4()),
            reason: Some("requested_by_customer".to_string()),
            metadata: HashMap::from([
                ("transaction_id".to_string(), transaction.id.to_string()),
                ("order_id".to_string(), transaction.order_id.to_string()),
            ]),
        };

        let receipt = (|| self.gateway.refund(request.clone()))
            .retry(self.retry.backoff())
            .when(|e: &GatewayError| e.is_transient())
            .notify(|e: &GatewayError, delay| {
                tracing::warn!(
                    transaction_id,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Refund request failed, retrying"
                );
            })
            .await
            .inspect_err(|e| {
                tracing::error!(transaction_id, amount, error = %e, "Refund rejected by gateway")
            })?;

        let refund = self.record(transaction_id, &receipt, amount)?;
        tracing::info!(
            transaction_id,
            order_id = refund.transaction.order_id,
            refund_id = %receipt.id,
            amount,
            status = %refund.transaction.status,
            "Refund issued"
        );
        Ok(refund)
    }

    /// Refund the order's most recent refundable transaction.
    pub async fn refund_order(
        &self,
        order_id: i64,
        amount: Option<i64>,
    ) -> Result<Refund, RefundError> {
        let transaction = {
            let conn = self.db.get()?;
            queries::get_latest_refundable_transaction(&conn, order_id)?
        };
        match transaction {
            Some(t) => self.refund(t.id, amount).await,
            None => {
                let conn = self.db.get()?;
                let refunded = queries::list_transactions_for_order(&conn, order_id)?
                    .iter()
                    .any(|t| t.status == TransactionStatus::Refunded);
                if refunded {
                    Err(RefundError::AlreadyRefunded)
                } else {
                    Err(RefundError::NothingToRefund(order_id))
                }
            }
        }
    }

    /// Apply a refund reported by the gateway (`charge.refunded`), which may have
    /// been issued from the gateway dashboard. `amount_refunded` is cumulative, so
    /// only the part not yet recorded is applied.
    pub fn apply_gateway_refund(
        &self,
        charge_id: &str,
        amount_refunded: i64,
        refund_id: Option<&str>,
    ) -> Result<Option<Transaction>, RefundError> {
        let mut conn = self.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(current) = queries::list_transactions_by_charge_id(&tx, charge_id)?
            .into_iter()
            .find(|t| t.status.is_settled())
        else {
            tracing::warn!(charge_id, "Refund event for unknown charge");
            return Ok(None);
        };

        if refund_id.is_some_and(|id| current.has_refund(id)) {
            tracing::debug!(charge_id, "Refund already recorded");
            return Ok(None);
        }
        let delta = amount_refunded - current.refunded_cents;
        if delta <= 0 {
            tracing::debug!(charge_id, amount_refunded, "Refund amount already recorded");
            return Ok(None);
        }

        let metadata = with_refund_entry(&current.metadata, refund_id, delta, "succeeded");
        let Some(updated) =
            queries::apply_refund_to_transaction(&tx, current.id, delta, &metadata)?
        else {
            tracing::warn!(
                charge_id,
                transaction_id = current.id,
                delta,
                "Gateway refund exceeds recorded payment, ignoring"
            );
            return Ok(None);
        };
        Self::refund_order_if_covered(&tx, updated.order_id)?;
        tx.commit()?;

        tracing::info!(
            charge_id,
            transaction_id = updated.id,
            amount = delta,
            "Gateway refund applied"
        );
        Ok(Some(updated))
    }

    fn record(
        &self,
        transaction_id: i64,
        receipt: &RefundReceipt,
        amount: i64,
    ) -> Result<Refund, RefundError> {
        let mut conn = self.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = queries::get_transaction_by_id(&tx, transaction_id)?
            .ok_or(RefundError::TransactionNotFound(transaction_id))?;

        // The refund webhook may have been processed before this call returned.
        let transaction = if current.has_refund(&receipt.id) {
            current
        } else {
            let metadata =
                with_refund_entry(&current.metadata, Some(&receipt.id), amount, &receipt.status);
            queries::apply_refund_to_transaction(&tx, transaction_id, amount, &metadata)?
                .ok_or_else(|| {
                    tracing::error!(
                        transaction_id,
                        refund_id = %receipt.id,
                        amount,
                        "Gateway refund could not be recorded"
                    );
                    RefundError::Unrecorded(receipt.id.clone())
                })?
        };

        let order_refunded = Self::refund_order_if_covered(&tx, transaction.order_id)?;
        tx.commit()?;

        Ok(Refund {
            refund: receipt.clone(),
            transaction,
            order_refunded,
        })
    }

    /// Move the order to refunded once refunds cover its total.
    fn refund_order_if_covered(conn: &Connection, order_id: i64) -> Result<bool, RefundError> {
        let Some(order) = queries::get_order_by_id(conn, order_id)? else {
            return Ok(false);
        };
        if order.status == OrderStatus::Refunded {
            return Ok(true);
        }
        let refunded = queries::sum_refunded_for_order(conn, order_id)?;
        if refunded < order.total_cents {
            return Ok(false);
        }

        match orders::transition(conn, &order, OrderStatus::Refunded) {
            Ok(_) => Ok(true),
            Err(TransitionError::Illegal { from, .. }) => {
                tracing::warn!(
                    order_id,
                    status = %from,
                    refunded,
                    "Order fully refunded but its status cannot move to refunded"
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
