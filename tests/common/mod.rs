//! Test utilities and fixtures for Shutterpay integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, params};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

// Re-export the main library crate
pub use shutterpay::config::{Config, DownloadPolicy, RateLimitConfig, RetryPolicy};
pub use shutterpay::db::{AppState, Collaborators, DbPool, create_pool, init_db, queries};
pub use shutterpay::downloads::{AccessError, DownloadLinkManager, Rejection};
pub use shutterpay::email::{EmailSendResult, Receipt, ReceiptNotifier};
pub use shutterpay::error::{AppError, Result};
pub use shutterpay::handlers;
pub use shutterpay::idempotency::MokaEventCache;
pub use shutterpay::jobs::{JobQueue, SettlementJob};
pub use shutterpay::models::*;
pub use shutterpay::payments::{
    ChargeDetails, GatewayError, IntentRequest, IntentStatus, PaymentGateway, PaymentIntent,
    RefundReceipt, RefundRequest,
};
pub use shutterpay::storage::{PhotoStore, StoredFile, content_type_for};
pub use shutterpay::token::{TokenCodec, TokenPayload};

pub const TEST_APP_KEY: &str = "test-app-key-0123456789abcdef0123456789";
pub const TEST_WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const TEST_ADMIN_KEY: &str = "admin-test-key";
pub const TEST_BASE_URL: &str = "http://shop.test";
pub const BUYER_ID: i64 = 11;
pub const SELLER_ID: i64 = 22;

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn future_timestamp(days: i64) -> i64 {
    now() + days * 86400
}

pub fn past_timestamp(days: i64) -> i64 {
    now() - days * 86400
}

// ============ Database ============

/// Create an in-memory test database with schema initialized
pub fn setup_test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("Failed to create in-memory database");
    init_db(&conn).expect("Failed to initialize schema");
    conn
}

/// File-backed pool so concurrent connections see the same database.
/// The file is removed on drop.
pub struct TestDb {
    pub pool: DbPool,
    path: PathBuf,
}

impl TestDb {
    pub fn new() -> Self {
        let path = std::env::temp_dir().join(format!("shutterpay-test-{}.db", uuid::Uuid::new_v4()));
        let pool = create_pool(path.to_str().expect("temp path is utf-8"))
            .expect("Failed to create test pool");
        {
            let conn = pool.get().expect("Failed to get connection");
            init_db(&conn).expect("Failed to initialize schema");
        }
        Self { pool, path }
    }

    pub fn conn(&self) -> PooledConnection<SqliteConnectionManager> {
        self.pool.get().expect("Failed to get connection")
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        let path = self.path.display().to_string();
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(format!("{}-wal", path));
        let _ = std::fs::remove_file(format!("{}-shm", path));
    }
}

// ============ Configuration ============

/// Config for tests: no tax, no rate limits, no settlement retry delays.
pub fn test_config() -> Config {
    Config {
        base_url: TEST_BASE_URL.to_string(),
        app_key: TEST_APP_KEY.to_string(),
        stripe_webhook_secret: Some(TEST_WEBHOOK_SECRET.to_string()),
        tax_rate_bps: 0,
        extra_photo_cents: 500,
        settlement_retry: RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        gateway_retry: RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        admin_api_key: Some(TEST_ADMIN_KEY.to_string()),
        rate_limit: RateLimitConfig::disabled(),
        ..Config::default()
    }
}

pub fn test_codec() -> TokenCodec {
    TokenCodec::from_app_key(TEST_APP_KEY).expect("test key is valid")
}

// ============ Mock gateway ============

/// In-process gateway. Intents live in a map; failures can be queued per call type.
#[derive(Default)]
pub struct MockGateway {
    intents: Mutex<HashMap<String, PaymentIntent>>,
    retrieve_failures: Mutex<VecDeque<GatewayError>>,
    refund_failures: Mutex<VecDeque<GatewayError>>,
    refunds: Mutex<Vec<RefundRequest>>,
    confirm_status: Mutex<Option<IntentStatus>>,
    intents_by_key: Mutex<HashMap<String, String>>,
    create_barrier: Mutex<Option<Arc<tokio::sync::Barrier>>>,
    next_id: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub retrieve_calls: AtomicUsize,
    pub refund_calls: AtomicUsize,
}

impl MockGateway {
    pub fn insert_intent(&self, intent: PaymentIntent) {
        self.intents.lock().unwrap().insert(intent.id.clone(), intent);
    }

    pub fn intent(&self, id: &str) -> Option<PaymentIntent> {
        self.intents.lock().unwrap().get(id).cloned()
    }

    pub fn fail_next_retrieve(&self, error: GatewayError) {
        self.retrieve_failures.lock().unwrap().push_back(error);
    }

    pub fn fail_next_refund(&self, error: GatewayError) {
        self.refund_failures.lock().unwrap().push_back(error);
    }

    /// Status intents end up in after `confirm_intent` (default: succeeded).
    pub fn set_confirm_status(&self, status: IntentStatus) {
        *self.confirm_status.lock().unwrap() = Some(status);
    }

    /// Hold every `create_intent` call until `parties` callers have arrived.
    pub fn hold_creates(&self, parties: usize) {
        *self.create_barrier.lock().unwrap() = Some(Arc::new(tokio::sync::Barrier::new(parties)));
    }

    pub fn refund_requests(&self) -> Vec<RefundRequest> {
        self.refunds.lock().unwrap().clone()
    }

    fn next(&self, prefix: &str) -> String {
        format!("{}_mock_{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn name(&self) -> &'static str {
        "stripe"
    }

    async fn create_intent(&self, request: IntentRequest) -> std::result::Result<PaymentIntent, GatewayError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let barrier = self.create_barrier.lock().unwrap().clone();
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }

        // Same idempotency key, same intent.
        let mut by_key = self.intents_by_key.lock().unwrap();
        if let Some(existing) = by_key
            .get(&request.idempotency_key)
            .and_then(|id| self.intent(id))
        {
            return Ok(existing);
        }
        let id = self.next("pi");
        by_key.insert(request.idempotency_key.clone(), id.clone());
        drop(by_key);
        let intent = PaymentIntent {
            client_secret: Some(format!("{}_secret", id)),
            id,
            status: IntentStatus::RequiresPaymentMethod,
            amount: request.amount,
            amount_received: 0,
            currency: request.currency,
            latest_charge: None,
            metadata: request.metadata,
            next_action: None,
        };
        self.insert_intent(intent.clone());
        Ok(intent)
    }

    async fn retrieve_intent(&self, intent_id: &str) -> std::result::Result<PaymentIntent, GatewayError> {
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.retrieve_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.intent(intent_id)
            .ok_or_else(|| GatewayError::Rejected(format!("No such payment_intent: {}", intent_id)))
    }

    async fn confirm_intent(
        &self,
        intent_id: &str,
        _payment_method: Option<&str>,
    ) -> std::result::Result<PaymentIntent, GatewayError> {
        let status = self
            .confirm_status
            .lock()
            .unwrap()
            .unwrap_or(IntentStatus::Succeeded);
        let mut intents = self.intents.lock().unwrap();
        let intent = intents
            .get_mut(intent_id)
            .ok_or_else(|| GatewayError::Rejected(format!("No such payment_intent: {}", intent_id)))?;
        intent.status = status;
        match status {
            IntentStatus::Succeeded => {
                intent.amount_received = intent.amount;
                intent.latest_charge = Some(ChargeDetails {
                    id: format!("ch_{}", intent.id),
                    receipt_url: Some(format!("https://pay.test/receipts/{}", intent.id)),
                    payment_method: Some("card".to_string()),
                });
            }
            IntentStatus::RequiresAction => {
                intent.next_action = Some(serde_json::json!({ "type": "use_stripe_sdk" }));
            }
            _ => {}
        }
        Ok(intent.clone())
    }

    async fn refund(&self, request: RefundRequest) -> std::result::Result<RefundReceipt, GatewayError> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.refund_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let receipt = RefundReceipt {
            id: self.next("re"),
            status: "succeeded".to_string(),
            amount: request.amount,
        };
        self.refunds.lock().unwrap().push(request);
        Ok(receipt)
    }
}

/// A succeeded intent that pays exactly for `order`, with a charge attached.
pub fn succeeded_intent(order: &Order, intent_id: &str, amount_received: i64) -> PaymentIntent {
    PaymentIntent {
        id: intent_id.to_string(),
        status: IntentStatus::Succeeded,
        amount: order.total_cents,
        amount_received,
        currency: order.currency.clone(),
        client_secret: None,
        latest_charge: Some(ChargeDetails {
            id: format!("ch_{}", intent_id),
            receipt_url: Some(format!("https://pay.test/receipts/{}", intent_id)),
            payment_method: Some("card".to_string()),
        }),
        metadata: HashMap::from([
            ("order_id".to_string(), order.id.to_string()),
            ("buyer_id".to_string(), order.buyer_id.to_string()),
            ("seller_id".to_string(), order.seller_id.to_string()),
        ]),
        next_action: None,
    }
}

// ============ Recording collaborators ============

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Receipt>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Receipt> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReceiptNotifier for RecordingNotifier {
    async fn send_receipt(&self, receipt: &Receipt) -> Result<EmailSendResult> {
        self.sent.lock().unwrap().push(receipt.clone());
        Ok(EmailSendResult::Sent)
    }
}

#[derive(Default)]
pub struct RecordingQueue {
    jobs: Mutex<Vec<SettlementJob>>,
}

impl RecordingQueue {
    pub fn jobs(&self) -> Vec<SettlementJob> {
        self.jobs.lock().unwrap().clone()
    }
}

impl JobQueue for RecordingQueue {
    fn enqueue(&self, job: SettlementJob) {
        self.jobs.lock().unwrap().push(job);
    }
}

#[derive(Default)]
pub struct MemoryPhotoStore {
    photos: Mutex<HashMap<i64, Vec<u8>>>,
    archives: Mutex<HashMap<i64, Vec<u8>>>,
    requested: Mutex<Vec<(i64, Vec<i64>)>>,
}

impl MemoryPhotoStore {
    pub fn put_photo(&self, photo_id: i64, bytes: &[u8]) {
        self.photos.lock().unwrap().insert(photo_id, bytes.to_vec());
    }

    pub fn put_archive(&self, order_id: i64, bytes: &[u8]) {
        self.archives.lock().unwrap().insert(order_id, bytes.to_vec());
    }

    pub fn archive_requests(&self) -> Vec<(i64, Vec<i64>)> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl PhotoStore for MemoryPhotoStore {
    async fn read_photo(&self, photo_id: i64, filename: &str) -> Result<Option<StoredFile>> {
        Ok(self.photos.lock().unwrap().get(&photo_id).map(|bytes| StoredFile {
            filename: filename.to_string(),
            content_type: content_type_for(filename),
            bytes: bytes.clone(),
        }))
    }

    async fn read_archive(&self, order_id: i64) -> Result<Option<StoredFile>> {
        Ok(self.archives.lock().unwrap().get(&order_id).map(|bytes| StoredFile {
            filename: format!("order-{}.zip", order_id),
            content_type: "application/zip",
            bytes: bytes.clone(),
        }))
    }

    async fn request_archive(&self, order: &Order, photo_ids: &[i64]) -> Result<()> {
        self.requested
            .lock()
            .unwrap()
            .push((order.id, photo_ids.to_vec()));
        Ok(())
    }
}

// ============ Application ============

/// Fully wired application over a temp database and in-process collaborators.
/// Settlement jobs are recorded, not run, unless a test runs them explicitly.
pub struct TestApp {
    pub config: Config,
    pub state: AppState,
    pub gateway: Arc<MockGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub jobs: Arc<RecordingQueue>,
    pub photos: Arc<MemoryPhotoStore>,
    pub db: TestDb,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let db = TestDb::new();
        let gateway = Arc::new(MockGateway::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let jobs = Arc::new(RecordingQueue::default());
        let photos = Arc::new(MemoryPhotoStore::default());

        let state = AppState::new(
            &config,
            db.pool.clone(),
            Collaborators {
                gateway: gateway.clone(),
                notifier: notifier.clone(),
                photos: photos.clone(),
                event_cache: Arc::new(MokaEventCache::new(config.webhook_dedup_ttl)),
            },
        )
        .expect("Failed to build app state")
        .with_job_queue(jobs.clone());

        Self {
            config,
            state,
            gateway,
            notifier,
            jobs,
            photos,
            db,
        }
    }

    /// Router without rate limiting
    pub fn router(&self) -> Router {
        handlers::app(self.state.clone(), RateLimitConfig::disabled())
    }

    pub fn conn(&self) -> PooledConnection<SqliteConnectionManager> {
        self.db.conn()
    }

    pub fn order(&self, order_id: i64) -> Order {
        queries::get_order_by_id(&self.conn(), order_id)
            .expect("query failed")
            .expect("order should exist")
    }
}

// ============ Fixtures ============

/// Create a direct order with one item per `(photo_id, filename, price)`.
pub fn create_test_order(conn: &Connection, photos: &[(i64, &str, i64)]) -> Order {
    let subtotal: i64 = photos.iter().map(|(_, _, price)| price).sum();
    let order = queries::create_order(
        conn,
        &NewOrder {
            order_number: format!("ORD-TEST-{}", uuid::Uuid::new_v4().simple()),
            buyer_id: BUYER_ID,
            seller_id: SELLER_ID,
            order_type: OrderType::Direct,
            status: OrderStatus::Pending,
            totals: OrderTotals::compute(subtotal, 0, 0),
            currency: "usd".to_string(),
            package_id: None,
            package_photo_count: None,
            buyer_email: Some("buyer@example.com".to_string()),
        },
    )
    .expect("Failed to create test order");

    for (photo_id, filename, price) in photos {
        queries::create_order_item(
            conn,
            order.id,
            &CreateOrderItem {
                photo_id: *photo_id,
                seller_id: SELLER_ID,
                filename: filename.to_string(),
                unit_price_cents: *price,
                quantity: 1,
            },
        )
        .expect("Failed to create test order item");
    }
    order
}

/// A single-photo direct order totalling 100.00 USD.
pub fn create_hundred_dollar_order(conn: &Connection) -> Order {
    create_test_order(conn, &[(101, "sunset.jpg", 10_000)])
}

pub fn create_test_pre_order(conn: &Connection, price_cents: i64, photo_count: i64) -> Order {
    queries::create_order(
        conn,
        &NewOrder {
            order_number: format!("ORD-TEST-{}", uuid::Uuid::new_v4().simple()),
            buyer_id: BUYER_ID,
            seller_id: SELLER_ID,
            order_type: OrderType::PreOrder,
            status: OrderStatus::PreOrderPending,
            totals: OrderTotals::compute(price_cents, 0, 0),
            currency: "usd".to_string(),
            package_id: Some(5),
            package_photo_count: Some(photo_count),
            buyer_email: Some("buyer@example.com".to_string()),
        },
    )
    .expect("Failed to create test pre-order")
}

/// Overwrite the stored status, bypassing the state machine.
pub fn force_order_status(conn: &Connection, order_id: i64, status: &str) {
    conn.execute(
        "UPDATE orders SET status = ?1 WHERE id = ?2",
        params![status, order_id],
    )
    .expect("Failed to force order status");
}

pub fn force_download_expiry(conn: &Connection, download_id: i64, expires_at: i64) {
    conn.execute(
        "UPDATE downloads SET expires_at = ?1 WHERE id = ?2",
        params![expires_at, download_id],
    )
    .expect("Failed to force download expiry");
}

/// Completed transaction with a charge id, as settlement would leave it.
pub fn create_settled_transaction(
    conn: &Connection,
    order: &Order,
    intent_id: &str,
    amount_cents: i64,
) -> Transaction {
    queries::create_transaction(
        conn,
        &CreateTransaction {
            order_id: order.id,
            gateway: "stripe".to_string(),
            gateway_transaction_id: intent_id.to_string(),
            amount_cents,
            currency: order.currency.clone(),
            status: TransactionStatus::Completed,
            metadata: serde_json::json!({ "charge_id": format!("ch_{}", intent_id) }),
            processed_at: Some(now()),
        },
    )
    .expect("Failed to create settled transaction")
}

/// Token embedded at the end of a signed download URL.
pub fn token_from_url(url: &str) -> String {
    url.rsplit('/').next().unwrap_or_default().to_string()
}

/// Build a `Stripe-Signature` header for `payload` at the current time.
pub fn stripe_signature(payload: &str) -> String {
    shutterpay::payments::sign_webhook_payload(TEST_WEBHOOK_SECRET, payload.as_bytes(), now())
        .expect("signing should succeed")
}
