//! Gateway-agnostic webhook handling.
//!
//! Providers verify and parse; everything after that (deduplication and
//! dispatch to settlement, failure recording and refunds) lives here.

use axum::{
    Json,
    body::Bytes,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::db::AppState;
use crate::idempotency::EventKind;
use crate::jobs::SettlementJob;

/// Rejection returned before any processing happens.
pub type WebhookResult = (StatusCode, &'static str);

/// A verified gateway notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEvent {
    /// Gateway's unique event id, used for deduplication
    pub id: String,
    pub kind: WebhookEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    /// Payment captured. `order_id` comes from the intent metadata we set.
    PaymentSucceeded { order_id: i64, intent_id: String },
    PaymentFailed { intent_id: String, reason: String },
    /// `amount_refunded` is cumulative over the charge's lifetime.
    Refunded {
        charge_id: String,
        amount_refunded: i64,
        refund_id: Option<String>,
    },
    /// Event type we do not act on
    Ignored,
}

impl WebhookEvent {
    fn guard_kind(&self) -> Option<EventKind> {
        match self {
            WebhookEvent::PaymentSucceeded { .. } => Some(EventKind::Succeeded),
            WebhookEvent::PaymentFailed { .. } => Some(EventKind::Failed),
            WebhookEvent::Refunded { .. } => Some(EventKind::Refunded),
            WebhookEvent::Ignored => None,
        }
    }
}

/// Provider-specific verification and parsing.
pub trait WebhookProvider: Send + Sync {
    /// Provider name for logging (e.g., "stripe")
    fn provider_name(&self) -> &'static str;

    /// Extract the signature from request headers.
    fn extract_signature(&self, headers: &HeaderMap) -> Result<String, WebhookResult>;

    /// Verify the signature against the raw body. Must run before parsing.
    fn verify_signature(&self, body: &Bytes, signature: &str) -> Result<(), WebhookResult>;

    /// Parse the verified payload into a provider-agnostic event.
    fn parse_event(&self, body: &Bytes) -> Result<GatewayEvent, WebhookResult>;
}

/// Verify, deduplicate and dispatch one webhook delivery.
///
/// Once the payload is verified the response is always 200: duplicates are
/// absorbed by the idempotency guard and processing failures are logged, since
/// a gateway retry would be dropped by the guard anyway.
pub async fn handle_webhook<P: WebhookProvider>(
    provider: &P,
    state: &AppState,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let event = match verify_and_parse(provider, &headers, &body) {
        Ok(event) => event,
        Err((status, message)) => {
            return (status, Json(json!({ "error": message }))).into_response();
        }
    };

    tracing::info!(
        provider = provider.provider_name(),
        event_id = %event.id,
        "Webhook received"
    );

    if let Some(kind) = event.kind.guard_kind() {
        if !state.guard.should_process(kind, &event.id) {
            tracing::info!(event_id = %event.id, kind = kind.as_ref(), "Webhook already processed");
            return received();
        }
    }

    dispatch(state, &event);
    received()
}

fn verify_and_parse<P: WebhookProvider>(
    provider: &P,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<GatewayEvent, WebhookResult> {
    let signature = provider.extract_signature(headers)?;
    provider.verify_signature(body, &signature)?;
    provider.parse_event(body)
}

fn dispatch(state: &AppState, event: &GatewayEvent) {
    match &event.kind {
        WebhookEvent::PaymentSucceeded {
            order_id,
            intent_id,
        } => {
            state.jobs.enqueue(SettlementJob {
                order_id: *order_id,
                intent_id: intent_id.clone(),
            });
        }
        WebhookEvent::PaymentFailed { intent_id, reason } => {
            if let Err(e) = state.settlement.record_failure(intent_id, reason) {
                tracing::error!(event_id = %event.id, intent_id, error = %e, "Failed to record payment failure");
            }
        }
        WebhookEvent::Refunded {
            charge_id,
            amount_refunded,
            refund_id,
        } => {
            if let Err(e) =
                state
                    .refunds
                    .apply_gateway_refund(charge_id, *amount_refunded, refund_id.as_deref())
            {
                tracing::error!(event_id = %event.id, charge_id, error = %e, "Failed to apply gateway refund");
            }
        }
        WebhookEvent::Ignored => {
            tracing::debug!(event_id = %event.id, "Webhook event ignored");
        }
    }
}

fn received() -> Response {
    (StatusCode::OK, Json(json!({ "received": true }))).into_response()
}
