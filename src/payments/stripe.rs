use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::{
    ChargeDetails, GatewayError, IntentRequest, IntentStatus, PaymentGateway, PaymentIntent,
    RefundReceipt, RefundRequest, SignatureError,
};

type HmacSha256 = Hmac<Sha256>;

const STRIPE_API_BASE: &str = "https://api.stripe.com";

/// Maximum age of a webhook timestamp before it's rejected (in seconds).
/// Stripe recommends 300 seconds (5 minutes).
pub const WEBHOOK_TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// Allowed clock skew for timestamps from the future.
const WEBHOOK_FUTURE_SKEW_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
struct StripeIntent {
    id: String,
    status: String,
    amount: i64,
    #[serde(default)]
    amount_received: i64,
    currency: String,
    client_secret: Option<String>,
    latest_charge: Option<StripeChargeRef>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    next_action: Option<serde_json::Value>,
}

/// `latest_charge` is an id unless the request expanded it.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StripeChargeRef {
    Id(String),
    Expanded(StripeCharge),
}

#[derive(Debug, Deserialize)]
struct StripeCharge {
    id: String,
    receipt_url: Option<String>,
    payment_method: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    status: Option<String>,
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
    code: Option<String>,
}

impl From<StripeIntent> for PaymentIntent {
    fn from(intent: StripeIntent) -> Self {
        let latest_charge = intent.latest_charge.map(|charge| match charge {
            StripeChargeRef::Id(id) => ChargeDetails {
                id,
                receipt_url: None,
                payment_method: None,
            },
            StripeChargeRef::Expanded(c) => ChargeDetails {
                id: c.id,
                receipt_url: c.receipt_url,
                payment_method: c.payment_method,
            },
        });
        PaymentIntent {
            id: intent.id,
            status: IntentStatus::from_gateway(&intent.status),
            amount: intent.amount,
            amount_received: intent.amount_received,
            currency: intent.currency,
            client_secret: intent.client_secret,
            latest_charge,
            metadata: intent.metadata,
            next_action: intent.next_action,
        }
    }
}

/// Stripe PaymentIntents adapter. Every call carries the client-level timeout.
#[derive(Debug, Clone)]
pub struct StripeGateway {
    client: Client,
    secret_key: String,
    api_base: String,
}

impl StripeGateway {
    pub fn new(secret_key: impl Into<String>, timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            secret_key: secret_key.into(),
            api_base: STRIPE_API_BASE.to_string(),
        })
    }

    /// Point the adapter at another API host (stripe-mock, tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client
            .post(format!("{}{}", self.api_base, path))
            .basic_auth(&self.secret_key, None::<&str>)
    }

    async fn send(request: RequestBuilder) -> Result<Response, GatewayError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout
            } else {
                GatewayError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<StripeErrorBody>(&body)
            .ok()
            .and_then(|b| b.error.message.or(b.error.code))
            .unwrap_or(body);

        tracing::warn!(status = status.as_u16(), "Stripe API error: {}", message);
        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => GatewayError::RateLimited,
            s if s.is_server_error() => GatewayError::Server {
                status: s.as_u16(),
                message,
            },
            _ => GatewayError::Rejected(message),
        })
    }

    async fn parse_intent(response: Response) -> Result<PaymentIntent, GatewayError> {
        let intent: StripeIntent = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(format!("Failed to parse Stripe response: {}", e)))?;
        Ok(intent.into())
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn name(&self) -> &'static str {
        "stripe"
    }

    async fn create_intent(&self, request: IntentRequest) -> Result<PaymentIntent, GatewayError> {
        let mut params = vec![
            ("amount".to_string(), request.amount.to_string()),
            ("currency".to_string(), request.currency.to_lowercase()),
            ("confirmation_method".to_string(), "manual".to_string()),
            ("expand[]".to_string(), "latest_charge".to_string()),
        ];
        if let Some(description) = request.description {
            params.push(("description".to_string(), description));
        }
        if let Some(email) = request.receipt_email {
            params.push(("receipt_email".to_string(), email));
        }
        for (key, value) in request.metadata {
            params.push((format!("metadata[{}]", key), value));
        }

        let response = Self::send(
            self.post("/v1/payment_intents")
                .header("Idempotency-Key", &request.idempotency_key)
                .form(&params),
        )
        .await?;
        Self::parse_intent(response).await
    }

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError> {
        let response = Self::send(
            self.client
                .get(format!("{}/v1/payment_intents/{}", self.api_base, intent_id))
                .basic_auth(&self.secret_key, None::<&str>)
                .query(&[("expand[]", "latest_charge")]),
        )
        .await?;
        Self::parse_intent(response).await
    }

    async fn confirm_intent(
        &self,
        intent_id: &str,
        payment_method: Option<&str>,
    ) -> Result<PaymentIntent, GatewayError> {
        let mut params = vec![("expand[]", "latest_charge")];
        if let Some(pm) = payment_method {
            params.push(("payment_method", pm));
        }
        let response = Self::send(
            self.post(&format!("/v1/payment_intents/{}/confirm", intent_id))
                .form(&params),
        )
        .await?;
        Self::parse_intent(response).await
    }

    async fn refund(&self, request: RefundRequest) -> Result<RefundReceipt, GatewayError> {
        let mut params = vec![
            ("charge".to_string(), request.charge_id),
            ("amount".to_string(), request.amount.to_string()),
        ];
        if let Some(reason) = request.reason {
            params.push(("reason".to_string(), reason));
        }
        for (key, value) in request.metadata {
            params.push((format!("metadata[{}]", key), value));
        }

        let response = Self::send(
            self.post("/v1/refunds")
                .header("Idempotency-Key", &request.idempotency_key)
                .form(&params),
        )
        .await?;
        let refund: StripeRefund = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(format!("Failed to parse Stripe refund: {}", e)))?;

        Ok(RefundReceipt {
            id: refund.id,
            status: refund.status.unwrap_or_else(|| "pending".to_string()),
            amount: refund.amount,
        })
    }
}

/// Verify a `Stripe-Signature` header (`t=timestamp,v1=signature[,v1=...]`)
/// against the raw request body.
pub fn verify_webhook_signature(
    secret: &str,
    payload: &[u8],
    header: &str,
    now: i64,
) -> Result<(), SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::NotConfigured);
    }

    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        let part = part.trim();
        if let Some(t) = part.strip_prefix("t=") {
            timestamp = Some(t);
        } else if let Some(s) = part.strip_prefix("v1=") {
            signatures.push(s);
        }
    }

    let timestamp_str = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed);
    }
    let timestamp: i64 = timestamp_str
        .parse()
        .map_err(|_| SignatureError::Malformed)?;

    // Reject old deliveries to limit replay, and tolerate a little clock skew.
    let age = now - timestamp;
    if age > WEBHOOK_TIMESTAMP_TOLERANCE_SECS || age < -WEBHOOK_FUTURE_SKEW_SECS {
        tracing::warn!(
            "Stripe webhook rejected: timestamp outside tolerance (age={}s)",
            age
        );
        return Err(SignatureError::Stale);
    }

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::NotConfigured)?;
    mac.update(timestamp_str.as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());
    let expected = expected.as_bytes();

    // Length is not secret (always 64 hex chars), only the content comparison is.
    let matched = signatures.iter().any(|sig| {
        let provided = sig.as_bytes();
        provided.len() == expected.len() && bool::from(expected.ct_eq(provided))
    });

    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Build a valid `Stripe-Signature` header. Used by tests and local tooling.
pub fn sign_webhook_payload(
    secret: &str,
    payload: &[u8],
    timestamp: i64,
) -> Result<String, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::NotConfigured)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const BODY: &[u8] = br#"{"id":"evt_1","type":"payment_intent.succeeded"}"#;

    #[test]
    fn test_valid_signature_is_accepted() {
        let header = sign_webhook_payload(SECRET, BODY, 1_700_000_000).unwrap();
        assert_eq!(
            verify_webhook_signature(SECRET, BODY, &header, 1_700_000_010),
            Ok(())
        );
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let header = sign_webhook_payload(SECRET, BODY, 1_700_000_000).unwrap();
        let tampered = br#"{"id":"evt_2","type":"payment_intent.succeeded"}"#;
        assert_eq!(
            verify_webhook_signature(SECRET, tampered, &header, 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_old_and_future_timestamps_are_rejected() {
        let header = sign_webhook_payload(SECRET, BODY, 1_700_000_000).unwrap();
        assert_eq!(
            verify_webhook_signature(SECRET, BODY, &header, 1_700_000_000 + 301),
            Err(SignatureError::Stale)
        );
        assert_eq!(
            verify_webhook_signature(SECRET, BODY, &header, 1_700_000_000 - 61),
            Err(SignatureError::Stale)
        );
    }

    #[test]
    fn test_malformed_headers() {
        for header in ["", "v1=abc", "t=123", "t=abc,v1=def"] {
            assert_eq!(
                verify_webhook_signature(SECRET, BODY, header, 123),
                Err(SignatureError::Malformed),
                "header {:?} should be malformed",
                header
            );
        }
        assert_eq!(
            verify_webhook_signature("", BODY, "t=1,v1=00", 1),
            Err(SignatureError::NotConfigured)
        );
    }

    #[test]
    fn test_intent_with_expanded_charge() {
        let json = r#"{
            "id": "pi_1", "status": "succeeded", "amount": 10000, "amount_received": 10000,
            "currency": "usd", "client_secret": "pi_1_secret",
            "latest_charge": {"id": "ch_1", "receipt_url": "https://pay.stripe.com/r/1", "payment_method": "pm_1"},
            "metadata": {"order_id": "7"}
        }"#;
        let intent: PaymentIntent = serde_json::from_str::<StripeIntent>(json).unwrap().into();
        assert_eq!(intent.status, IntentStatus::Succeeded);
        let charge = intent.latest_charge.unwrap();
        assert_eq!(charge.id, "ch_1");
        assert_eq!(charge.receipt_url.as_deref(), Some("https://pay.stripe.com/r/1"));
        assert_eq!(intent.metadata["order_id"], "7");
    }

    #[test]
    fn test_intent_with_charge_id_only() {
        let json = r#"{"id": "pi_2", "status": "processing", "amount": 500,
            "currency": "usd", "latest_charge": "ch_2"}"#;
        let intent: PaymentIntent = serde_json::from_str::<StripeIntent>(json).unwrap().into();
        assert_eq!(intent.amount_received, 0);
        assert_eq!(intent.latest_charge.unwrap().id, "ch_2");
    }
}
