use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
};
use serde::{Deserialize, Serialize};

use crate::checkout::{ConfirmOutcome, OpenedIntent};
use crate::crypto::constant_time_eq;
use crate::db::AppState;
use crate::error::{AppError, Result};
use crate::models::{CreateOrder, CreatePreOrder, Order, OrderItem};
use crate::preorders::PhotoSelection;
use crate::refunds::Refund;
use crate::util::extract_bearer_token;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/pre-orders", post(create_pre_order))
        .route("/orders/{order_id}/payment-intent", post(open_payment_intent))
        .route("/orders/{order_id}/confirm", post(confirm_payment))
        .route("/orders/{order_id}/refund", post(refund_order))
        .route("/orders/{order_id}/selection", post(begin_selection))
        .route("/orders/{order_id}/finalize", post(finalize_selection))
}

#[derive(Serialize)]
pub struct OrderResponse {
    pub order: Order,
    pub items: Vec<OrderItem>,
}

/// The buyer making a request. Authentication happens in front of this service.
#[derive(Deserialize)]
pub struct BuyerRequest {
    pub buyer_id: i64,
}

#[derive(Deserialize)]
pub struct ConfirmRequest {
    pub buyer_id: i64,
    pub payment_intent_id: String,
    #[serde(default)]
    pub payment_method: Option<String>,
}

#[derive(Deserialize)]
pub struct RefundBody {
    /// Minor units; omitted means refund whatever remains
    #[serde(default)]
    pub amount_cents: Option<i64>,
}

#[derive(Deserialize)]
pub struct SelectionRequest {
    pub gallery_id: i64,
}

#[derive(Deserialize)]
pub struct FinalizeRequest {
    pub photos: Vec<PhotoSelection>,
}

/// POST /orders
pub async fn create_order(
    State(state): State<AppState>,
    Json(input): Json<CreateOrder>,
) -> Result<(StatusCode, Json<OrderResponse>)> {
    let (order, items) = state.checkout.create_order(input)?;
    Ok((StatusCode::CREATED, Json(OrderResponse { order, items })))
}

/// POST /pre-orders
pub async fn create_pre_order(
    State(state): State<AppState>,
    Json(input): Json<CreatePreOrder>,
) -> Result<(StatusCode, Json<Order>)> {
    let order = state.checkout.create_pre_order(input)?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// POST /orders/{order_id}/payment-intent
pub async fn open_payment_intent(
    State(state): State<AppState>,
    Path(order_id): Path<i64>,
    Json(input): Json<BuyerRequest>,
) -> Result<Json<OpenedIntent>> {
    let opened = state
        .checkout
        .open_payment_intent(order_id, input.buyer_id)
        .await?;
    Ok(Json(opened))
}

/// POST /orders/{order_id}/confirm
/// Synchronous confirmation. Settlement itself still runs through the job queue.
pub async fn confirm_payment(
    State(state): State<AppState>,
    Path(order_id): Path<i64>,
    Json(input): Json<ConfirmRequest>,
) -> Result<Json<ConfirmOutcome>> {
    let outcome = state
        .checkout
        .confirm_payment(
            order_id,
            input.buyer_id,
            &input.payment_intent_id,
            input.payment_method.as_deref(),
            state.jobs.as_ref(),
        )
        .await?;
    Ok(Json(outcome))
}

/// POST /orders/{order_id}/refund
/// Photographer/admin only. Requires `Authorization: Bearer {ADMIN_API_KEY}`.
pub async fn refund_order(
    State(state): State<AppState>,
    Path(order_id): Path<i64>,
    headers: HeaderMap,
    Json(input): Json<RefundBody>,
) -> Result<Json<Refund>> {
    require_admin(&state, &headers)?;
    let refund = state
        .refunds
        .refund_order(order_id, input.amount_cents)
        .await?;
    Ok(Json(refund))
}

/// POST /orders/{order_id}/selection
pub async fn begin_selection(
    State(state): State<AppState>,
    Path(order_id): Path<i64>,
    Json(input): Json<SelectionRequest>,
) -> Result<Json<Order>> {
    let order = state.preorders.begin_selection(order_id, input.gallery_id)?;
    Ok(Json(order))
}

/// POST /orders/{order_id}/finalize
pub async fn finalize_selection(
    State(state): State<AppState>,
    Path(order_id): Path<i64>,
    Json(input): Json<FinalizeRequest>,
) -> Result<Json<OrderResponse>> {
    let (order, items) = state.preorders.finalize(order_id, input.photos)?;
    Ok(Json(OrderResponse { order, items }))
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let Some(expected) = state.admin_api_key.as_deref() else {
        tracing::warn!("Refund requested but ADMIN_API_KEY is not configured");
        return Err(AppError::Forbidden("Refunds are disabled".into()));
    };
    match extract_bearer_token(headers) {
        Some(token) if constant_time_eq(token, expected) => Ok(()),
        _ => Err(AppError::Unauthorized),
    }
}
