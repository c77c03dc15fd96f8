//! Turns a gateway "payment succeeded" fact into durable order and transaction
//! state, exactly once per intent.
//!
//! `settle` may be called any number of times for the same (order, intent): from
//! the webhook path, the synchronous confirmation path, and job retries. Only the
//! first call mutates anything; later calls observe the completed transaction
//! under the write lock and return `AlreadySettled`.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::TransactionBehavior;
use serde_json::json;
use thiserror::Error;

use crate::db::{DbPool, queries};
use crate::downloads::DownloadLinkManager;
use crate::email::{Receipt, ReceiptLink, ReceiptNotifier};
use crate::error::AppError;
use crate::models::{
    CreateTransaction, Order, Transaction, TransactionStatus, merge_metadata,
};
use crate::orders::{self, TransitionError};
use crate::payments::{GatewayError, IntentStatus, PaymentGateway, PaymentIntent};
use crate::util::now;

/// The intent does not describe the order it claims to pay for.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityMismatch {
    #[error("intent references order {found:?}, expected {expected}")]
    OrderId {
        expected: i64,
        found: Option<String>,
    },

    #[error("intent currency {found} does not match order currency {expected}")]
    Currency { expected: String, found: String },

    #[error("intent amount {found} does not match order total {expected} (captured: {captured})")]
    Amount {
        expected: i64,
        found: i64,
        captured: bool,
    },

    #[error("intent buyer {found} does not match order buyer {expected}")]
    Buyer { expected: i64, found: String },

    #[error("intent seller {found} does not match order seller {expected}")]
    Seller { expected: i64, found: String },
}

impl From<IntegrityMismatch> for AppError {
    fn from(err: IntegrityMismatch) -> Self {
        AppError::Unprocessable(err.to_string())
    }
}

/// Check that `intent` pays exactly for `order`.
///
/// Succeeded intents are compared on the captured amount, anything else on the
/// intended amount. Buyer and seller are only checked when the intent carries them.
pub fn assert_intent_matches_order(
    intent: &PaymentIntent,
    order: &Order,
) -> Result<(), IntegrityMismatch> {
    let order_ref = intent.metadata.get("order_id");
    if order_ref.and_then(|id| id.parse::<i64>().ok()) != Some(order.id) {
        return Err(IntegrityMismatch::OrderId {
            expected: order.id,
            found: order_ref.cloned(),
        });
    }

    if !intent.currency.eq_ignore_ascii_case(&order.currency) {
        return Err(IntegrityMismatch::Currency {
            expected: order.currency.clone(),
            found: intent.currency.clone(),
        });
    }

    let amount = intent.captured_or_intended();
    if amount != order.total_cents {
        return Err(IntegrityMismatch::Amount {
            expected: order.total_cents,
            found: amount,
            captured: intent.status == IntentStatus::Succeeded,
        });
    }

    if let Some(buyer) = intent.metadata.get("buyer_id") {
        if buyer.parse::<i64>().ok() != Some(order.buyer_id) {
            return Err(IntegrityMismatch::Buyer {
                expected: order.buyer_id,
                found: buyer.clone(),
            });
        }
    }

    if let Some(seller) = intent.metadata.get("seller_id") {
        if seller.parse::<i64>().ok() != Some(order.seller_id) {
            return Err(IntegrityMismatch::Seller {
                expected: order.seller_id,
                found: seller.clone(),
            });
        }
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("order {0} not found")]
    OrderNotFound(i64),

    #[error(transparent)]
    Integrity(#[from] IntegrityMismatch),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Storage(#[from] AppError),
}

impl From<rusqlite::Error> for SettlementError {
    fn from(e: rusqlite::Error) -> Self {
        SettlementError::Storage(e.into())
    }
}

impl From<r2d2::Error> for SettlementError {
    fn from(e: r2d2::Error) -> Self {
        SettlementError::Storage(e.into())
    }
}

impl SettlementError {
    /// Whether a later attempt could succeed. Integrity failures, permanent
    /// gateway errors and illegal transitions never will.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Gateway(e) => e.is_transient(),
            Self::Transition(TransitionError::Stale | TransitionError::Storage(_)) => true,
            Self::Storage(_) => true,
            Self::OrderNotFound(_) | Self::Integrity(_) | Self::Transition(_) => false,
        }
    }
}

impl From<SettlementError> for AppError {
    fn from(err: SettlementError) -> Self {
        match err {
            SettlementError::OrderNotFound(id) => AppError::NotFound(format!("Order {} not found", id)),
            SettlementError::Integrity(e) => e.into(),
            SettlementError::Gateway(e) => e.into(),
            SettlementError::Transition(e) => e.into(),
            SettlementError::Storage(e) => e,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settlement {
    pub order: Order,
    pub transaction: Transaction,
}

#[derive(Debug, Clone)]
pub enum SettlementOutcome {
    /// This call completed the transaction and advanced the order.
    Settled(Settlement),
    /// A previous call already settled this intent; nothing changed.
    AlreadySettled(Settlement),
    /// The gateway does not report the payment as succeeded; nothing changed.
    NotSucceeded { status: IntentStatus },
}

pub struct SettlementService {
    db: DbPool,
    gateway: Arc<dyn PaymentGateway>,
    links: DownloadLinkManager,
    notifier: Arc<dyn ReceiptNotifier>,
}

impl SettlementService {
    pub fn new(
        db: DbPool,
        gateway: Arc<dyn PaymentGateway>,
        links: DownloadLinkManager,
        notifier: Arc<dyn ReceiptNotifier>,
    ) -> Self {
        Self {
            db,
            gateway,
            links,
            notifier,
        }
    }

    pub async fn settle(
        &self,
        order_id: i64,
        intent_id: &str,
    ) -> Result<SettlementOutcome, SettlementError> {
        let intent = self.gateway.retrieve_intent(intent_id).await?;
        if intent.status != IntentStatus::Succeeded {
            tracing::info!(
                order_id,
                intent_id,
                status = %intent.status,
                "Payment intent not succeeded, skipping settlement"
            );
            return Ok(SettlementOutcome::NotSucceeded {
                status: intent.status,
            });
        }

        let order = {
            let conn = self.db.get()?;
            queries::get_order_by_id(&conn, order_id)?
                .ok_or(SettlementError::OrderNotFound(order_id))?
        };
        if let Err(mismatch) = assert_intent_matches_order(&intent, &order) {
            tracing::error!(
                order_id,
                intent_id,
                order_total = order.total_cents,
                order_currency = %order.currency,
                intent_amount = intent.amount,
                intent_amount_received = intent.amount_received,
                intent_currency = %intent.currency,
                intent_metadata = ?intent.metadata,
                error = %mismatch,
                "Payment intent does not match order, settlement aborted"
            );
            return Err(mismatch.into());
        }

        let (settlement, fresh) = self.apply(order_id, &intent)?;

        if let Err(e) = self.ensure_grants(&settlement.order) {
            tracing::error!(order_id, error = %e, "Failed to issue download grants after settlement");
        }

        if fresh {
            tracing::info!(
                order_id,
                intent_id,
                transaction_id = settlement.transaction.id,
                status = %settlement.order.status,
                "Payment settled"
            );
            self.send_receipt(&settlement).await;
            Ok(SettlementOutcome::Settled(settlement))
        } else {
            tracing::info!(order_id, intent_id, "Payment already settled");
            Ok(SettlementOutcome::AlreadySettled(settlement))
        }
    }

    /// Record a `payment_failed` event against the intent's open transaction.
    /// The order is left untouched so the buyer can retry payment.
    pub fn record_failure(
        &self,
        intent_id: &str,
        reason: &str,
    ) -> Result<Option<Transaction>, SettlementError> {
        let conn = self.db.get()?;
        let Some(transaction) =
            queries::get_transaction_by_gateway_id(&conn, self.gateway.name(), intent_id)?
        else {
            tracing::warn!(intent_id, "Payment failure for unknown intent");
            return Ok(None);
        };
        if !transaction.status.is_open() {
            tracing::info!(
                intent_id,
                status = %transaction.status,
                "Ignoring payment failure for transaction that is no longer open"
            );
            return Ok(None);
        }

        let metadata = merge_metadata(
            &transaction.metadata,
            json!({ "failure_reason": reason, "failed_at": now() }),
        );
        let updated = queries::update_open_transaction(
            &conn,
            transaction.id,
            transaction.status,
            TransactionStatus::Failed,
            Some(&metadata),
        )?;
        if updated.is_some() {
            tracing::info!(
                order_id = transaction.order_id,
                intent_id,
                reason,
                "Payment marked failed"
            );
        }
        Ok(updated)
    }

    /// Steps that must be all-or-nothing, under the database write lock.
    fn apply(
        &self,
        order_id: i64,
        intent: &PaymentIntent,
    ) -> Result<(Settlement, bool), SettlementError> {
        let mut conn = self.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let order = queries::get_order_by_id(&tx, order_id)?
            .ok_or(SettlementError::OrderNotFound(order_id))?;
        let existing = queries::get_transaction_by_gateway_id(&tx, self.gateway.name(), &intent.id)?;

        if let Some(transaction) = existing.as_ref().filter(|t| t.status.is_settled()) {
            let settlement = Settlement {
                order,
                transaction: transaction.clone(),
            };
            tx.commit()?;
            return Ok((settlement, false));
        }

        let processed_at = now();
        let transaction = match existing {
            Some(open) => {
                let metadata = merge_metadata(&open.metadata, intent.charge_metadata());
                queries::complete_transaction(
                    &tx,
                    open.id,
                    intent.amount_received,
                    &metadata,
                    processed_at,
                )?
                .ok_or_else(|| AppError::Internal("transaction vanished during settlement".into()))?
            }
            None => queries::create_transaction(
                &tx,
                &CreateTransaction {
                    order_id,
                    gateway: self.gateway.name().to_string(),
                    gateway_transaction_id: intent.id.clone(),
                    amount_cents: intent.amount_received,
                    currency: order.currency.clone(),
                    status: TransactionStatus::Completed,
                    metadata: intent.charge_metadata(),
                    processed_at: Some(processed_at),
                },
            )?,
        };

        let order = orders::advance_to(&tx, &order, orders::paid_target(order.order_type))?;
        tx.commit()?;

        Ok((Settlement { order, transaction }, true))
    }

    /// Mint grants unless a previous run already did.
    fn ensure_grants(&self, order: &Order) -> crate::error::Result<()> {
        if !order.status.grants_access() {
            return Ok(());
        }
        let existing = {
            let conn = self.db.get()?;
            queries::count_downloads_for_order(&conn, order.id)?
        };
        if existing > 0 {
            tracing::debug!(order_id = order.id, "Download grants already exist, skipping");
            return Ok(());
        }
        let grants = self.links.ensure_all(order)?;
        tracing::info!(order_id = order.id, grants = grants.len(), "Download grants issued");
        Ok(())
    }

    async fn send_receipt(&self, settlement: &Settlement) {
        let order = &settlement.order;
        let Some(to) = order.buyer_email.clone() else {
            tracing::debug!(order_id = order.id, "No buyer email, skipping receipt");
            return;
        };

        let receipt = match self.build_receipt(order, &settlement.transaction, to) {
            Ok(receipt) => receipt,
            Err(e) => {
                tracing::error!(order_id = order.id, error = %e, "Failed to build receipt");
                return;
            }
        };
        if let Err(e) = self.notifier.send_receipt(&receipt).await {
            tracing::error!(order_id = order.id, error = %e, "Failed to send receipt");
        }
    }

    fn build_receipt(
        &self,
        order: &Order,
        transaction: &Transaction,
        to: String,
    ) -> crate::error::Result<Receipt> {
        let (items, downloads) = {
            let conn = self.db.get()?;
            (
                queries::list_order_items(&conn, order.id)?,
                queries::list_downloads_for_order_user(&conn, order.id, order.buyer_id)?,
            )
        };
        let filenames: HashMap<i64, String> = items
            .into_iter()
            .map(|item| (item.photo_id, item.filename))
            .collect();

        let mut links = Vec::with_capacity(downloads.len());
        for download in &downloads {
            match self.links.current_url(download) {
                Ok(current) => links.push(ReceiptLink {
                    filename: filenames
                        .get(&current.photo_id)
                        .cloned()
                        .unwrap_or_else(|| format!("photo-{}", current.photo_id)),
                    url: current.download_url,
                    expires_at: current.expires_at,
                }),
                Err(e) => {
                    tracing::warn!(download_id = download.id, error = %e, "Leaving link out of receipt")
                }
            }
        }

        let batch_url = if !links.is_empty() {
            Some(self.links.batch_url(order)?)
        } else {
            None
        };

        Ok(Receipt {
            to,
            order_number: order.order_number.clone(),
            total_cents: order.total_cents,
            currency: order.currency.clone(),
            receipt_url: transaction.receipt_url().map(str::to_string),
            links,
            batch_url,
        })
    }
}
