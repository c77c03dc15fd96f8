pub mod common;
pub mod stripe;

pub use stripe::{StripeWebhookProvider, handle_stripe_webhook};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use serde_json::json;

use crate::db::AppState;
use crate::error::msg;

pub fn router(requests_per_minute: u32) -> Router<AppState> {
    let router = Router::new().route("/webhooks/{gateway}", post(handle_gateway_webhook));
    match crate::rate_limit::layer(requests_per_minute) {
        Some(limiter) => router.layer(limiter),
        None => router,
    }
}

/// POST /webhooks/{gateway}
pub async fn handle_gateway_webhook(
    State(state): State<AppState>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match gateway.as_str() {
        "stripe" => handle_stripe_webhook(State(state), headers, body).await,
        other => {
            tracing::warn!(gateway = other, "Webhook for unsupported gateway");
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": msg::UNSUPPORTED_GATEWAY })),
            )
                .into_response()
        }
    }
}
