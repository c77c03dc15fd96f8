//! Payment receipt email with download links.
//!
//! Sent through the Resend API when an API key is configured; otherwise the
//! receipt is logged and skipped.

use async_trait::async_trait;
use backon::Retryable;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::RetryPolicy;
use crate::error::{AppError, Result};
use crate::util::{format_date, format_money};

const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// Result of attempting to send a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailSendResult {
    /// Email was sent successfully via Resend
    Sent,
    /// No API key configured
    NoApiKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptLink {
    pub filename: String,
    pub url: String,
    pub expires_at: i64,
}

/// Everything a receipt needs, resolved before sending.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub to: String,
    pub order_number: String,
    pub total_cents: i64,
    pub currency: String,
    /// Gateway-hosted receipt, when the charge has one
    pub receipt_url: Option<String>,
    pub links: Vec<ReceiptLink>,
    /// One link for the whole order as an archive
    pub batch_url: Option<String>,
}

/// Delivers receipts after settlement. Failures never roll back a settlement.
#[async_trait]
pub trait ReceiptNotifier: Send + Sync {
    async fn send_receipt(&self, receipt: &Receipt) -> Result<EmailSendResult>;
}

/// Resend API request body.
#[derive(Debug, Serialize)]
struct ResendEmailRequest<'a> {
    from: &'a str,
    to: Vec<&'a str>,
    subject: String,
    text: String,
    html: String,
}

/// Resend API response.
#[derive(Debug, Deserialize)]
struct ResendEmailResponse {
    #[allow(dead_code)]
    id: String,
}

/// A failed Resend call and whether it is worth retrying.
#[derive(Debug)]
struct SendFailure {
    error: AppError,
    transient: bool,
}

#[derive(Clone)]
pub struct EmailService {
    api_key: Option<String>,
    from_email: String,
    http_client: Client,
    retry: RetryPolicy,
}

impl EmailService {
    pub fn new(api_key: Option<String>, from_email: String) -> Self {
        Self {
            api_key,
            from_email,
            http_client: Client::new(),
            retry: RetryPolicy::email(),
        }
    }

    /// Send a request to Resend API with exponential backoff retry.
    ///
    /// Retries on transient errors (network issues, 5xx, 429 rate limit).
    /// Fails immediately on non-transient errors (4xx except 429).
    async fn send_request_with_retry(
        &self,
        api_key: &str,
        request: &ResendEmailRequest<'_>,
    ) -> Result<EmailSendResult> {
        (|| self.send_resend_request(api_key, request))
            .retry(self.retry.backoff())
            .when(|failure: &SendFailure| failure.transient)
            .notify(|failure: &SendFailure, delay| {
                tracing::warn!(
                    error = %failure.error,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying receipt email after transient failure"
                );
            })
            .await
            .map_err(|failure| {
                tracing::error!(to = ?request.to, error = %failure.error, "Receipt email failed");
                failure.error
            })?;

        tracing::info!(to = ?request.to, "Receipt email sent via Resend");
        Ok(EmailSendResult::Sent)
    }

    async fn send_resend_request(
        &self,
        api_key: &str,
        request: &ResendEmailRequest<'_>,
    ) -> std::result::Result<(), SendFailure> {
        let response = self
            .http_client
            .post(RESEND_API_URL)
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to send request to Resend API");
                SendFailure {
                    error: AppError::Internal(format!("Email service error: {}", e)),
                    transient: true,
                }
            })?;

        let status = response.status();
        if status.is_success() {
            let _result: ResendEmailResponse = response.json().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to parse Resend API response");
                SendFailure {
                    error: AppError::Internal("Email service response error".into()),
                    transient: false,
                }
            })?;
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let is_transient = is_transient_status(status);
        if is_transient {
            tracing::warn!(status = %status, body = %body, "Resend API returned transient error");
        } else {
            tracing::error!(status = %status, body = %body, "Resend API returned non-transient error");
        }
        Err(SendFailure {
            error: AppError::Internal(format!("Email service error: {} - {}", status, body)),
            transient: is_transient,
        })
    }
}

#[async_trait]
impl ReceiptNotifier for EmailService {
    async fn send_receipt(&self, receipt: &Receipt) -> Result<EmailSendResult> {
        let Some(api_key) = self.api_key.as_deref() else {
            tracing::warn!(
                order_number = %receipt.order_number,
                "No Resend API key configured, skipping receipt email"
            );
            return Ok(EmailSendResult::NoApiKey);
        };

        let request = ResendEmailRequest {
            from: &self.from_email,
            to: vec![receipt.to.as_str()],
            subject: format!("Your receipt for order {}", receipt.order_number),
            text: render_text(receipt),
            html: render_html(receipt),
        };
        self.send_request_with_retry(api_key, &request).await
    }
}

/// Rate limiting and server errors are retried; other failures are final.
fn is_transient_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn render_text(receipt: &Receipt) -> String {
    let mut text = format!(
        "Thank you for your purchase!\n\nOrder {}\nTotal: {}\n",
        receipt.order_number,
        format_money(receipt.total_cents, &receipt.currency)
    );
    if let Some(url) = &receipt.receipt_url {
        text.push_str(&format!("Payment receipt: {}\n", url));
    }
    if !receipt.links.is_empty() {
        text.push_str("\nYour downloads:\n");
        for link in &receipt.links {
            text.push_str(&format!(
                "- {}: {} (available until {})\n",
                link.filename,
                link.url,
                format_date(link.expires_at)
            ));
        }
    }
    if let Some(url) = &receipt.batch_url {
        text.push_str(&format!("\nDownload everything as one archive: {}\n", url));
    }
    text
}

fn render_html(receipt: &Receipt) -> String {
    let links: String = receipt
        .links
        .iter()
        .map(|link| {
            format!(
                r#"<li><a href="{}">{}</a> <span style="color: #666; font-size: 14px;">(available until {})</span></li>"#,
                escape_html(&link.url),
                escape_html(&link.filename),
                format_date(link.expires_at)
            )
        })
        .collect();
    let receipt_link = receipt
        .receipt_url
        .as_deref()
        .map(|url| format!(r#"<p><a href="{}">View payment receipt</a></p>"#, escape_html(url)))
        .unwrap_or_default();
    let batch_link = receipt
        .batch_url
        .as_deref()
        .map(|url| format!(r#"<p><a href="{}">Download all photos as one archive</a></p>"#, escape_html(url)))
        .unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 600px; margin: 0 auto; padding: 20px;">
<h2 style="color: #333;">Thank you for your purchase!</h2>
<p>Order <strong>{}</strong>, total <strong>{}</strong>.</p>
{}
<ul>{}</ul>
{}
<hr style="border: none; border-top: 1px solid #eee; margin: 30px 0;">
<p style="color: #999; font-size: 12px;">Download links expire and allow a limited number of downloads.</p>
</body>
</html>"#,
        escape_html(&receipt.order_number),
        format_money(receipt.total_cents, &receipt.currency),
        receipt_link,
        links,
        batch_link
    )
}

pub(crate) fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
