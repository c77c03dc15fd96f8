use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Response,
};
use serde::Deserialize;

use crate::db::AppState;
use crate::error::msg;
use crate::payments::{SignatureError, verify_webhook_signature};
use crate::util::now;

use super::common::{GatewayEvent, WebhookEvent, WebhookProvider, WebhookResult, handle_webhook};

#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct IntentObject {
    id: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    last_payment_error: Option<PaymentError>,
}

#[derive(Debug, Deserialize)]
struct PaymentError {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChargeObject {
    id: String,
    amount_refunded: i64,
    #[serde(default)]
    refunds: Option<RefundList>,
}

#[derive(Debug, Deserialize)]
struct RefundList {
    #[serde(default)]
    data: Vec<RefundRef>,
}

#[derive(Debug, Deserialize)]
struct RefundRef {
    id: String,
}

/// Stripe webhook provider implementation.
pub struct StripeWebhookProvider {
    secret: Option<String>,
}

impl StripeWebhookProvider {
    pub fn new(secret: Option<String>) -> Self {
        Self { secret }
    }
}

impl WebhookProvider for StripeWebhookProvider {
    fn provider_name(&self) -> &'static str {
        "stripe"
    }

    fn extract_signature(&self, headers: &HeaderMap) -> Result<String, WebhookResult> {
        headers
            .get("stripe-signature")
            .ok_or((StatusCode::BAD_REQUEST, msg::MISSING_SIGNATURE))?
            .to_str()
            .map(|s| s.to_string())
            .map_err(|e| {
                tracing::debug!("Invalid UTF-8 in Stripe signature header: {}", e);
                (StatusCode::BAD_REQUEST, msg::INVALID_SIGNATURE_HEADER)
            })
    }

    fn verify_signature(&self, body: &Bytes, signature: &str) -> Result<(), WebhookResult> {
        let secret = self.secret.as_deref().unwrap_or_default();
        verify_webhook_signature(secret, body, signature, now()).map_err(|e| {
            match &e {
                SignatureError::NotConfigured => {
                    tracing::error!("Stripe webhook received but STRIPE_WEBHOOK_SECRET is not set")
                }
                _ => tracing::warn!("Stripe webhook signature verification failed: {}", e),
            }
            let message = match &e {
                SignatureError::Malformed => msg::INVALID_SIGNATURE_HEADER,
                _ => msg::INVALID_SIGNATURE,
            };
            (StatusCode::BAD_REQUEST, message)
        })
    }

    fn parse_event(&self, body: &Bytes) -> Result<GatewayEvent, WebhookResult> {
        let event: StripeEvent = serde_json::from_slice(body).map_err(|e| {
            tracing::error!("Failed to parse Stripe webhook: {}", e);
            (StatusCode::BAD_REQUEST, msg::INVALID_PAYLOAD)
        })?;

        let kind = match event.event_type.as_str() {
            "payment_intent.succeeded" => parse_payment_succeeded(event.data.object)?,
            "payment_intent.payment_failed" => parse_payment_failed(event.data.object)?,
            "charge.refunded" => parse_charge_refunded(event.data.object)?,
            other => {
                tracing::debug!(event_type = other, "Unhandled Stripe event type");
                WebhookEvent::Ignored
            }
        };
        Ok(GatewayEvent { id: event.id, kind })
    }
}

fn parse_object<T: serde::de::DeserializeOwned>(
    object: serde_json::Value,
    what: &str,
) -> Result<T, WebhookResult> {
    serde_json::from_value(object).map_err(|e| {
        tracing::error!("Failed to parse Stripe {}: {}", what, e);
        (StatusCode::BAD_REQUEST, msg::INVALID_PAYLOAD)
    })
}

fn parse_payment_succeeded(object: serde_json::Value) -> Result<WebhookEvent, WebhookResult> {
    let intent: IntentObject = parse_object(object, "payment intent")?;
    let order_id = intent
        .metadata
        .get("order_id")
        .and_then(|id| id.parse::<i64>().ok());
    match order_id {
        Some(order_id) => Ok(WebhookEvent::PaymentSucceeded {
            order_id,
            intent_id: intent.id,
        }),
        None => {
            tracing::warn!(intent_id = %intent.id, "Payment intent succeeded without an order_id in metadata");
            Ok(WebhookEvent::Ignored)
        }
    }
}

fn parse_payment_failed(object: serde_json::Value) -> Result<WebhookEvent, WebhookResult> {
    let intent: IntentObject = parse_object(object, "payment intent")?;
    let reason = intent
        .last_payment_error
        .and_then(|e| e.message)
        .unwrap_or_else(|| "Unknown error".to_string());
    Ok(WebhookEvent::PaymentFailed {
        intent_id: intent.id,
        reason,
    })
}

fn parse_charge_refunded(object: serde_json::Value) -> Result<WebhookEvent, WebhookResult> {
    let charge: ChargeObject = parse_object(object, "charge")?;
    let refund_id = charge
        .refunds
        .and_then(|list| list.data.into_iter().next())
        .map(|r| r.id);
    Ok(WebhookEvent::Refunded {
        charge_id: charge.id,
        amount_refunded: charge.amount_refunded,
        refund_id,
    })
}

/// Axum handler for Stripe webhooks.
pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let provider = state.stripe_webhooks.clone();
    handle_webhook(provider.as_ref(), &state, headers, body).await
}
