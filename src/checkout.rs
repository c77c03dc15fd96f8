//! Order creation and the buyer-facing half of payment: opening a gateway intent
//! and confirming it synchronously.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use serde_json::json;

use crate::db::{DbPool, queries};
use crate::error::{AppError, Result, msg};
use crate::jobs::{JobQueue, SettlementJob};
use crate::models::{
    CreateOrder, CreatePreOrder, CreateTransaction, NewOrder, Order, OrderItem, OrderStatus,
    OrderTotals, OrderType, TransactionStatus,
};
use crate::orders;
use crate::payments::{IntentRequest, IntentStatus, PaymentGateway, PaymentIntent};
use crate::settlement::assert_intent_matches_order;

#[derive(Debug, Clone, Serialize)]
pub struct OpenedIntent {
    pub order_id: i64,
    pub transaction_id: i64,
    pub intent_id: String,
    pub client_secret: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    /// An open intent from an earlier visit was handed back instead of a new one
    pub reused: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfirmOutcome {
    /// 3-D Secure or similar; the client must complete the next action.
    RequiresAction {
        intent_id: String,
        client_secret: Option<String>,
        next_action: Option<serde_json::Value>,
    },
    /// Payment captured; settlement has been queued.
    Succeeded { intent_id: String },
    /// Anything else: declined, canceled, still processing.
    NotCompleted {
        intent_id: String,
        intent_status: IntentStatus,
    },
}

pub struct CheckoutService {
    db: DbPool,
    gateway: Arc<dyn PaymentGateway>,
    currency: String,
    tax_rate_bps: i64,
}

impl CheckoutService {
    pub fn new(
        db: DbPool,
        gateway: Arc<dyn PaymentGateway>,
        currency: String,
        tax_rate_bps: i64,
    ) -> Self {
        Self {
            db,
            gateway,
            currency,
            tax_rate_bps,
        }
    }

    /// Create a direct order. Every item must come from the same seller; totals
    /// are computed here once and stored.
    pub fn create_order(&self, input: CreateOrder) -> Result<(Order, Vec<OrderItem>)> {
        let first = input
            .items
            .first()
            .ok_or_else(|| AppError::BadRequest(msg::EMPTY_ORDER.into()))?;
        let seller_id = first.seller_id;
        if input.items.iter().any(|item| item.seller_id != seller_id) {
            return Err(AppError::BadRequest(msg::MIXED_SELLERS.into()));
        }
        if input
            .items
            .iter()
            .any(|item| item.unit_price_cents < 0 || item.quantity <= 0)
        {
            return Err(AppError::BadRequest(msg::INVALID_ITEM.into()));
        }

        let subtotal: i64 = input
            .items
            .iter()
            .map(|item| item.unit_price_cents * item.quantity)
            .sum();
        let totals = OrderTotals::compute(subtotal, input.discount_cents, self.tax_rate_bps);

        let mut conn = self.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let order = queries::create_order(
            &tx,
            &NewOrder {
                order_number: next_order_number(&tx)?,
                buyer_id: input.buyer_id,
                seller_id,
                order_type: OrderType::Direct,
                status: OrderStatus::Pending,
                totals,
                currency: self.currency_for(input.currency),
                package_id: None,
                package_photo_count: None,
                buyer_email: input.buyer_email,
            },
        )?;
        let items = input
            .items
            .iter()
            .map(|item| queries::create_order_item(&tx, order.id, item))
            .collect::<Result<Vec<_>>>()?;
        tx.commit()?;

        tracing::info!(
            order_id = order.id,
            order_number = %order.order_number,
            buyer_id = order.buyer_id,
            seller_id,
            total_cents = order.total_cents,
            "Order created"
        );
        Ok((order, items))
    }

    /// Create a pre-order for a package. Photos are chosen after payment.
    pub fn create_pre_order(&self, input: CreatePreOrder) -> Result<Order> {
        if input.package_price_cents < 0 || input.package_photo_count <= 0 {
            return Err(AppError::BadRequest(
                "Package price and photo count must be positive".into(),
            ));
        }
        let totals = OrderTotals::compute(input.package_price_cents, 0, self.tax_rate_bps);

        let mut conn = self.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let order = queries::create_order(
            &tx,
            &NewOrder {
                order_number: next_order_number(&tx)?,
                buyer_id: input.buyer_id,
                seller_id: input.seller_id,
                order_type: OrderType::PreOrder,
                status: OrderStatus::PreOrderPending,
                totals,
                currency: self.currency_for(input.currency),
                package_id: Some(input.package_id),
                package_photo_count: Some(input.package_photo_count),
                buyer_email: input.buyer_email,
            },
        )?;
        tx.commit()?;

        tracing::info!(
            order_id = order.id,
            package_id = input.package_id,
            total_cents = order.total_cents,
            "Pre-order created"
        );
        Ok(order)
    }

    /// Start (or resume) payment for an order the buyer owns.
    ///
    /// An open transaction whose intent is still usable is handed back, so
    /// reloading the payment page does not create a second intent.
    pub async fn open_payment_intent(&self, order_id: i64, buyer_id: i64) -> Result<OpenedIntent> {
        let (order, open, attempt) = {
            let conn = self.db.get()?;
            let order = load_owned_order(&conn, order_id, buyer_id)?;
            let open = queries::get_open_transaction_for_order(&conn, order_id)?;
            let attempt = queries::list_transactions_for_order(&conn, order_id)?.len();
            (order, open, attempt)
        };
        let status = orders::normalize(order.order_type, order.status);
        if !matches!(status, OrderStatus::Pending | OrderStatus::PreOrderPending) {
            return Err(AppError::Conflict(msg::ORDER_NOT_PAYABLE.into()));
        }

        if let Some(open) = open.filter(|t| t.gateway == self.gateway.name()) {
            match self.gateway.retrieve_intent(&open.gateway_transaction_id).await {
                Ok(intent) if Self::reusable(&intent, &order) => {
                    tracing::debug!(order_id, intent_id = %intent.id, "Reusing open payment intent");
                    return Ok(OpenedIntent {
                        order_id,
                        transaction_id: open.id,
                        intent_id: intent.id,
                        client_secret: intent.client_secret,
                        amount_cents: order.total_cents,
                        currency: order.currency,
                        reused: true,
                    });
                }
                Ok(intent) => {
                    tracing::info!(order_id, intent_id = %intent.id, status = %intent.status, "Open intent not reusable");
                }
                Err(e) => {
                    tracing::warn!(order_id, error = %e, "Failed to retrieve existing payment intent");
                }
            }
        }

        // Concurrent requests for the same attempt share a key, so the gateway
        // replays one intent to both and the transaction insert converges.
        let intent = self
            .gateway
            .create_intent(IntentRequest {
                amount: order.total_cents,
                currency: order.currency.clone(),
                idempotency_key: format!("pi_{}_{}", order.id, attempt),
                metadata: HashMap::from([
                    ("order_id".to_string(), order.id.to_string()),
                    ("order_number".to_string(), order.order_number.clone()),
                    ("buyer_id".to_string(), order.buyer_id.to_string()),
                    ("seller_id".to_string(), order.seller_id.to_string()),
                ]),
                description: Some(format!("Order {}", order.order_number)),
                receipt_email: order.buyer_email.clone(),
            })
            .await?;

        let transaction = {
            let conn = self.db.get()?;
            queries::create_transaction(
                &conn,
                &CreateTransaction {
                    order_id,
                    gateway: self.gateway.name().to_string(),
                    gateway_transaction_id: intent.id.clone(),
                    amount_cents: order.total_cents,
                    currency: order.currency.clone(),
                    status: TransactionStatus::Pending,
                    metadata: json!({ "intent_status": intent.status.as_ref() }),
                    processed_at: None,
                },
            )?
        };

        tracing::info!(
            order_id,
            transaction_id = transaction.id,
            intent_id = %intent.id,
            "Payment intent opened"
        );
        Ok(OpenedIntent {
            order_id,
            transaction_id: transaction.id,
            intent_id: intent.id,
            client_secret: intent.client_secret,
            amount_cents: order.total_cents,
            currency: order.currency,
            reused: false,
        })
    }

    /// Confirm an intent on the buyer's behalf. A succeeded payment is verified
    /// against the order and handed to the settlement queue.
    pub async fn confirm_payment(
        &self,
        order_id: i64,
        buyer_id: i64,
        intent_id: &str,
        payment_method: Option<&str>,
        jobs: &dyn JobQueue,
    ) -> Result<ConfirmOutcome> {
        let order = {
            let conn = self.db.get()?;
            load_owned_order(&conn, order_id, buyer_id)?
        };

        let intent = self.gateway.confirm_intent(intent_id, payment_method).await?;
        if let Err(mismatch) = assert_intent_matches_order(&intent, &order) {
            tracing::warn!(
                order_id,
                intent_id,
                error = %mismatch,
                "Payment verification failed"
            );
            return Err(mismatch.into());
        }

        Ok(match intent.status {
            IntentStatus::RequiresAction => ConfirmOutcome::RequiresAction {
                intent_id: intent.id,
                client_secret: intent.client_secret,
                next_action: intent.next_action,
            },
            IntentStatus::Succeeded => {
                jobs.enqueue(SettlementJob {
                    order_id,
                    intent_id: intent.id.clone(),
                });
                ConfirmOutcome::Succeeded {
                    intent_id: intent.id,
                }
            }
            status => {
                tracing::info!(order_id, intent_id, status = %status, "Payment not completed");
                ConfirmOutcome::NotCompleted {
                    intent_id: intent.id,
                    intent_status: status,
                }
            }
        })
    }

    fn currency_for(&self, requested: Option<String>) -> String {
        requested
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| self.currency.clone())
            .to_lowercase()
    }

    fn reusable(intent: &PaymentIntent, order: &Order) -> bool {
        !matches!(
            intent.status,
            IntentStatus::Canceled | IntentStatus::Succeeded | IntentStatus::Unknown
        ) && intent.amount == order.total_cents
    }
}

fn load_owned_order(conn: &Connection, order_id: i64, buyer_id: i64) -> Result<Order> {
    let order = queries::get_order_by_id(conn, order_id)?
        .ok_or_else(|| AppError::NotFound(msg::ORDER_NOT_FOUND.into()))?;
    if order.buyer_id != buyer_id {
        // Same answer as a missing order so other buyers cannot enumerate ids.
        return Err(AppError::NotFound(msg::ORDER_NOT_FOUND.into()));
    }
    Ok(order)
}

/// Next `ORD-YYYYMMDD-NNNNN` number for today. Call inside a write transaction.
fn next_order_number(conn: &Connection) -> Result<String> {
    let prefix = format!("ORD-{}-", Utc::now().format("%Y%m%d"));
    let sequence = queries::last_order_number_with_prefix(conn, &prefix)?
        .and_then(|last| last.strip_prefix(&prefix).and_then(|s| s.parse::<u32>().ok()))
        .map_or(1, |last| last + 1);
    Ok(format!("{}{:05}", prefix, sequence))
}
