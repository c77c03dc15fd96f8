//! Checkout tests: order creation, payment intents and synchronous confirmation

mod common;

use common::*;
use shutterpay::checkout::ConfirmOutcome;
use std::sync::atomic::Ordering;

fn item(photo_id: i64, seller_id: i64, price: i64) -> CreateOrderItem {
    CreateOrderItem {
        photo_id,
        seller_id,
        filename: format!("photo-{}.jpg", photo_id),
        unit_price_cents: price,
        quantity: 1,
    }
}

fn cart(items: Vec<CreateOrderItem>) -> CreateOrder {
    CreateOrder {
        buyer_id: BUYER_ID,
        buyer_email: Some("buyer@example.com".to_string()),
        items,
        discount_cents: 0,
        currency: None,
    }
}

fn taxed_app() -> TestApp {
    let mut config = test_config();
    config.tax_rate_bps = 800;
    TestApp::with_config(config)
}

// ============ Order creation ============

#[test]
fn test_create_order_computes_totals() {
    let app = taxed_app();
    let mut input = cart(vec![item(1, SELLER_ID, 2_500), item(2, SELLER_ID, 2_500)]);
    input.discount_cents = 1_000;

    let (order, items) = app.state.checkout.create_order(input).unwrap();

    assert_eq!(order.subtotal_cents, 5_000);
    assert_eq!(order.discount_cents, 1_000);
    assert_eq!(order.tax_cents, 320, "8% of the discounted subtotal");
    assert_eq!(order.total_cents, 4_320);
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.order_type, OrderType::Direct);
    assert_eq!(order.seller_id, SELLER_ID);
    assert_eq!(order.currency, "usd");
    assert_eq!(items.len(), 2);
}

#[test]
fn test_order_numbers_are_sequential_per_day() {
    let app = TestApp::new();
    let (first, _) = app
        .state
        .checkout
        .create_order(cart(vec![item(1, SELLER_ID, 100)]))
        .unwrap();
    let (second, _) = app
        .state
        .checkout
        .create_order(cart(vec![item(2, SELLER_ID, 100)]))
        .unwrap();

    let today = chrono::Utc::now().format("%Y%m%d").to_string();
    assert_eq!(first.order_number, format!("ORD-{}-00001", today));
    assert_eq!(second.order_number, format!("ORD-{}-00002", today));
}

#[test]
fn test_mixed_sellers_are_rejected() {
    let app = TestApp::new();
    let err = app
        .state
        .checkout
        .create_order(cart(vec![item(1, SELLER_ID, 100), item(2, SELLER_ID + 1, 100)]))
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)), "got {:?}", err);
}

#[test]
fn test_empty_cart_is_rejected() {
    let app = TestApp::new();
    let err = app.state.checkout.create_order(cart(vec![])).unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[test]
fn test_currency_is_normalized() {
    let app = TestApp::new();
    let mut input = cart(vec![item(1, SELLER_ID, 100)]);
    input.currency = Some("EUR".to_string());

    let (order, _) = app.state.checkout.create_order(input).unwrap();
    assert_eq!(order.currency, "eur");
}

#[test]
fn test_create_pre_order() {
    let app = TestApp::new();
    let order = app
        .state
        .checkout
        .create_pre_order(CreatePreOrder {
            buyer_id: BUYER_ID,
            buyer_email: None,
            seller_id: SELLER_ID,
            package_id: 3,
            package_price_cents: 15_000,
            package_photo_count: 10,
            currency: None,
        })
        .unwrap();

    assert_eq!(order.order_type, OrderType::PreOrder);
    assert_eq!(order.status, OrderStatus::PreOrderPending);
    assert_eq!(order.total_cents, 15_000);
    assert_eq!(order.package_photo_count, Some(10));
}

// ============ Payment intents ============

#[tokio::test]
async fn test_open_intent_records_pending_transaction() {
    let app = TestApp::new();
    let order = create_hundred_dollar_order(&app.conn());

    let opened = app
        .state
        .checkout
        .open_payment_intent(order.id, BUYER_ID)
        .await
        .unwrap();

    assert!(!opened.reused);
    assert_eq!(opened.amount_cents, 10_000);
    assert!(opened.client_secret.is_some());
    let intent = app.gateway.intent(&opened.intent_id).unwrap();
    assert_eq!(intent.metadata["order_id"], order.id.to_string());
    assert_eq!(intent.metadata["buyer_id"], BUYER_ID.to_string());
    assert_eq!(intent.metadata["seller_id"], SELLER_ID.to_string());

    let transaction = queries::get_transaction_by_id(&app.conn(), opened.transaction_id)
        .unwrap()
        .unwrap();
    assert_eq!(transaction.status, TransactionStatus::Pending);
    assert_eq!(transaction.gateway_transaction_id, opened.intent_id);
}

#[tokio::test]
async fn test_open_intent_reuses_open_intent() {
    let app = TestApp::new();
    let order = create_hundred_dollar_order(&app.conn());

    let first = app
        .state
        .checkout
        .open_payment_intent(order.id, BUYER_ID)
        .await
        .unwrap();
    let second = app
        .state
        .checkout
        .open_payment_intent(order.id, BUYER_ID)
        .await
        .unwrap();

    assert!(second.reused);
    assert_eq!(second.intent_id, first.intent_id);
    assert_eq!(second.transaction_id, first.transaction_id);
    assert_eq!(app.gateway.create_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_open_intent_for_other_buyer_is_not_found() {
    let app = TestApp::new();
    let order = create_hundred_dollar_order(&app.conn());

    let err = app
        .state
        .checkout
        .open_payment_intent(order.id, BUYER_ID + 1)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    assert_eq!(app.gateway.create_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_open_intent_for_paid_order_conflicts() {
    let app = TestApp::new();
    let order = create_hundred_dollar_order(&app.conn());
    force_order_status(&app.conn(), order.id, "processing");

    let err = app
        .state
        .checkout
        .open_payment_intent(order.id, BUYER_ID)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn test_concurrent_open_intent_converges_on_one_transaction() {
    let app = TestApp::new();
    let order = create_hundred_dollar_order(&app.conn());
    app.gateway.hold_creates(2);

    let (first, second) = tokio::join!(
        app.state.checkout.open_payment_intent(order.id, BUYER_ID),
        app.state.checkout.open_payment_intent(order.id, BUYER_ID),
    );
    let first = first.expect("first request should succeed");
    let second = second.expect("second request should succeed");

    assert_eq!(first.intent_id, second.intent_id);
    assert_eq!(first.transaction_id, second.transaction_id);
    let transactions = queries::list_transactions_for_order(&app.conn(), order.id).unwrap();
    assert_eq!(transactions.len(), 1);
}

#[test]
fn test_create_transaction_returns_existing_row_on_conflict() {
    let conn = setup_test_db();
    let order = create_hundred_dollar_order(&conn);
    let input = CreateTransaction {
        order_id: order.id,
        gateway: "stripe".to_string(),
        gateway_transaction_id: "pi_shared".to_string(),
        amount_cents: 10_000,
        currency: "usd".to_string(),
        status: TransactionStatus::Completed,
        metadata: serde_json::json!({ "charge_id": "ch_shared" }),
        processed_at: Some(now()),
    };
    let winner = queries::create_transaction(&conn, &input).unwrap();

    let mut late = input.clone();
    late.status = TransactionStatus::Pending;
    let existing = queries::create_transaction(&conn, &late).expect("conflict is not an error");

    assert_eq!(existing.id, winner.id);
    assert_eq!(existing.status, TransactionStatus::Completed);
}

// ============ Confirmation ============

#[tokio::test]
async fn test_confirm_succeeded_queues_settlement() {
    let app = TestApp::new();
    let order = create_hundred_dollar_order(&app.conn());
    let opened = app
        .state
        .checkout
        .open_payment_intent(order.id, BUYER_ID)
        .await
        .unwrap();

    let outcome = app
        .state
        .checkout
        .confirm_payment(order.id, BUYER_ID, &opened.intent_id, Some("pm_card_visa"), &*app.jobs)
        .await
        .unwrap();

    assert!(matches!(outcome, ConfirmOutcome::Succeeded { .. }));
    assert_eq!(
        app.jobs.jobs(),
        vec![SettlementJob {
            order_id: order.id,
            intent_id: opened.intent_id.clone()
        }]
    );
    assert_eq!(
        app.order(order.id).status,
        OrderStatus::Pending,
        "order changes only when the job runs"
    );
}

#[tokio::test]
async fn test_confirm_requires_action() {
    let app = TestApp::new();
    let order = create_hundred_dollar_order(&app.conn());
    let opened = app
        .state
        .checkout
        .open_payment_intent(order.id, BUYER_ID)
        .await
        .unwrap();
    app.gateway.set_confirm_status(IntentStatus::RequiresAction);

    let outcome = app
        .state
        .checkout
        .confirm_payment(order.id, BUYER_ID, &opened.intent_id, None, &*app.jobs)
        .await
        .unwrap();

    let ConfirmOutcome::RequiresAction { next_action, .. } = outcome else {
        panic!("expected RequiresAction, got {:?}", outcome);
    };
    assert!(next_action.is_some());
    assert!(app.jobs.jobs().is_empty());
}

#[tokio::test]
async fn test_confirm_with_foreign_intent_is_unprocessable() {
    let app = TestApp::new();
    let order = create_hundred_dollar_order(&app.conn());
    let other = create_hundred_dollar_order(&app.conn());
    let foreign = app
        .state
        .checkout
        .open_payment_intent(other.id, BUYER_ID)
        .await
        .unwrap();

    let err = app
        .state
        .checkout
        .confirm_payment(order.id, BUYER_ID, &foreign.intent_id, None, &*app.jobs)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Unprocessable(_)));
    assert!(app.jobs.jobs().is_empty());
}

#[tokio::test]
async fn test_confirmed_payment_settles_through_job() {
    let app = TestApp::new();
    let order = create_hundred_dollar_order(&app.conn());
    let opened = app
        .state
        .checkout
        .open_payment_intent(order.id, BUYER_ID)
        .await
        .unwrap();
    app.state
        .checkout
        .confirm_payment(order.id, BUYER_ID, &opened.intent_id, None, &*app.jobs)
        .await
        .unwrap();

    let job = app.jobs.jobs().pop().expect("job should be queued");
    app.state
        .settlement
        .settle(job.order_id, &job.intent_id)
        .await
        .expect("settlement should succeed");

    assert_eq!(app.order(order.id).status, OrderStatus::Processing);
    let grants = queries::list_downloads_for_order_user(&app.conn(), order.id, BUYER_ID).unwrap();
    assert_eq!(grants.len(), 1);
}
