//! HTTP handler tests: health, downloads and order endpoints

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use common::*;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

async fn get(app: &TestApp, uri: &str) -> Response {
    app.router()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn post_json(app: &TestApp, uri: &str, body: Value, bearer: Option<&str>) -> Response {
    let mut request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = bearer {
        request = request.header("authorization", format!("Bearer {}", token));
    }
    app.router()
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).expect("response should be JSON")
}

/// Paid order with one photo present in storage and its grant issued.
fn order_with_photo(app: &TestApp) -> (Order, Download) {
    let order = create_test_order(&app.conn(), &[(501, "beach.jpg", 10_000)]);
    force_order_status(&app.conn(), order.id, "completed");
    let order = app.order(order.id);
    app.photos.put_photo(501, b"jpeg-bytes");
    let download = app.state.links.ensure(&order, 501).unwrap();
    (order, download)
}

fn download_path(download: &Download) -> String {
    format!("/download/{}", token_from_url(&download.download_url))
}

// ============ Health ============

#[tokio::test]
async fn test_health() {
    let app = TestApp::new();
    let response = get(&app, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

// ============ Single downloads ============

#[tokio::test]
async fn test_download_serves_attachment() {
    let app = TestApp::new();
    let (_, download) = order_with_photo(&app);

    let response = get(&app, &download_path(&download)).await;

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers[header::CONTENT_TYPE], "image/jpeg");
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        "attachment; filename=\"beach.jpg\""
    );
    assert_eq!(headers[header::CACHE_CONTROL], "private, no-store");
    assert_eq!(body_bytes(response).await, b"jpeg-bytes");

    let stored = queries::get_download_by_id(&app.conn(), download.id)
        .unwrap()
        .unwrap();
    assert_eq!(stored.attempts, 1, "successful download consumes an attempt");
}

#[tokio::test]
async fn test_download_invalid_token_is_404() {
    let app = TestApp::new();
    let response = get(&app, "/download/not-a-token").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let html = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(html.contains("invalid or no longer available"));
}

#[tokio::test]
async fn test_download_expired_is_410() {
    let app = TestApp::new();
    let (_, download) = order_with_photo(&app);
    force_download_expiry(&app.conn(), download.id, past_timestamp(1));

    let response = get(&app, &download_path(&download)).await;
    assert_eq!(response.status(), StatusCode::GONE);
}

#[tokio::test]
async fn test_download_exhausted_is_410() {
    let app = TestApp::new();
    let (_, download) = order_with_photo(&app);
    let path = download_path(&download);

    for _ in 0..3 {
        assert_eq!(get(&app, &path).await.status(), StatusCode::OK);
    }
    assert_eq!(get(&app, &path).await.status(), StatusCode::GONE);
}

#[tokio::test]
async fn test_missing_file_does_not_consume_attempt() {
    let app = TestApp::new();
    let order = create_test_order(&app.conn(), &[(502, "lost.jpg", 10_000)]);
    force_order_status(&app.conn(), order.id, "completed");
    let download = app.state.links.ensure(&app.order(order.id), 502).unwrap();

    let response = get(&app, &download_path(&download)).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let stored = queries::get_download_by_id(&app.conn(), download.id)
        .unwrap()
        .unwrap();
    assert_eq!(stored.attempts, 0);
}

// ============ Batch downloads ============

#[tokio::test]
async fn test_batch_without_archive_is_accepted() {
    let app = TestApp::new();
    let (order, _) = order_with_photo(&app);
    let url = app.state.links.batch_url(&order).unwrap();

    let response = get(&app, &format!("/download/batch/{}", token_from_url(&url))).await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(app.photos.archive_requests(), vec![(order.id, vec![501])]);
}

#[tokio::test]
async fn test_batch_serves_archive() {
    let app = TestApp::new();
    let (order, _) = order_with_photo(&app);
    app.photos.put_archive(order.id, b"zip-bytes");
    let url = app.state.links.batch_url(&order).unwrap();

    let response = get(&app, &format!("/download/batch/{}", token_from_url(&url))).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        format!("attachment; filename=\"order_{}_photos.zip\"", order.order_number).as_str()
    );
    assert_eq!(body_bytes(response).await, b"zip-bytes");
}

// ============ Orders ============

#[tokio::test]
async fn test_create_order_endpoint() {
    let app = TestApp::new();
    let response = post_json(
        &app,
        "/orders",
        json!({
            "buyer_id": BUYER_ID,
            "buyer_email": "buyer@example.com",
            "items": [
                { "photo_id": 1, "seller_id": SELLER_ID, "filename": "a.jpg", "unit_price_cents": 1500 },
                { "photo_id": 2, "seller_id": SELLER_ID, "filename": "b.jpg", "unit_price_cents": 2500 }
            ]
        }),
        None,
    )
    .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["order"]["total_cents"], 4_000);
    assert_eq!(body["order"]["status"], "pending");
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_payment_intent_endpoint() {
    let app = TestApp::new();
    let order = create_hundred_dollar_order(&app.conn());

    let response = post_json(
        &app,
        &format!("/orders/{}/payment-intent", order.id),
        json!({ "buyer_id": BUYER_ID }),
        None,
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["amount_cents"], 10_000);
    assert!(body["client_secret"].is_string());
}

#[tokio::test]
async fn test_confirm_with_foreign_intent_is_422() {
    let app = TestApp::new();
    let order = create_hundred_dollar_order(&app.conn());
    let other = create_hundred_dollar_order(&app.conn());
    let foreign = app
        .state
        .checkout
        .open_payment_intent(other.id, BUYER_ID)
        .await
        .unwrap();

    let response = post_json(
        &app,
        &format!("/orders/{}/confirm", order.id),
        json!({ "buyer_id": BUYER_ID, "payment_intent_id": foreign.intent_id }),
        None,
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["details"], "Payment verification failed");
}

// ============ Refund authorization ============

#[tokio::test]
async fn test_refund_requires_admin_key() {
    let app = TestApp::new();
    let order = create_hundred_dollar_order(&app.conn());
    force_order_status(&app.conn(), order.id, "processing");
    create_settled_transaction(&app.conn(), &order, "pi_admin", 10_000);
    let uri = format!("/orders/{}/refund", order.id);

    let missing = post_json(&app, &uri, json!({}), None).await;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = post_json(&app, &uri, json!({}), Some("not-the-key")).await;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let ok = post_json(&app, &uri, json!({ "amount_cents": 2_500 }), Some(TEST_ADMIN_KEY)).await;
    assert_eq!(ok.status(), StatusCode::OK);
    let body = body_json(ok).await;
    assert_eq!(body["transaction"]["refunded_cents"], 2_500);
    assert_eq!(body["order_refunded"], false);
}

#[tokio::test]
async fn test_refund_disabled_without_admin_key() {
    let mut config = test_config();
    config.admin_api_key = None;
    let app = TestApp::with_config(config);
    let order = create_hundred_dollar_order(&app.conn());

    let response = post_json(
        &app,
        &format!("/orders/{}/refund", order.id),
        json!({}),
        Some("anything"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
