mod from_row;
mod schema;
pub mod queries;

pub use from_row::{FromRow, query_all, query_one};
pub use schema::init_db;

use std::sync::Arc;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::checkout::CheckoutService;
use crate::config::Config;
use crate::downloads::DownloadLinkManager;
use crate::email::ReceiptNotifier;
use crate::handlers::webhooks::StripeWebhookProvider;
use crate::idempotency::{EventCache, WebhookIdempotencyGuard};
use crate::jobs::{JobQueue, TokioJobQueue};
use crate::payments::PaymentGateway;
use crate::preorders::PreOrderService;
use crate::refunds::RefundService;
use crate::settlement::SettlementService;
use crate::storage::PhotoStore;
use crate::token::{TokenCodec, TokenError};

pub type DbPool = Pool<SqliteConnectionManager>;

/// External collaborators injected into the application.
pub struct Collaborators {
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn ReceiptNotifier>,
    pub photos: Arc<dyn PhotoStore>,
    pub event_cache: Arc<dyn EventCache>,
}

/// Application state shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    /// Base URL for signed download links (e.g., https://shop.example.com)
    pub base_url: String,
    pub links: DownloadLinkManager,
    pub checkout: Arc<CheckoutService>,
    pub preorders: Arc<PreOrderService>,
    pub settlement: Arc<SettlementService>,
    pub refunds: Arc<RefundService>,
    pub guard: WebhookIdempotencyGuard,
    pub jobs: Arc<dyn JobQueue>,
    pub photos: Arc<dyn PhotoStore>,
    pub stripe_webhooks: Arc<StripeWebhookProvider>,
    /// Bearer key for photographer/admin operations (refunds)
    pub admin_api_key: Option<String>,
}

impl AppState {
    /// Wire services together. Settlement jobs run on a tokio-backed queue unless
    /// replaced with `with_job_queue`.
    pub fn new(config: &Config, db: DbPool, deps: Collaborators) -> Result<Self, TokenError> {
        let codec = TokenCodec::from_app_key(&config.app_key)?;
        let links = DownloadLinkManager::new(
            db.clone(),
            codec,
            config.downloads,
            config.base_url.clone(),
        );
        let settlement = Arc::new(SettlementService::new(
            db.clone(),
            deps.gateway.clone(),
            links.clone(),
            deps.notifier,
        ));
        let refunds = Arc::new(RefundService::new(
            db.clone(),
            deps.gateway.clone(),
            config.gateway_retry,
        ));
        let checkout = Arc::new(CheckoutService::new(
            db.clone(),
            deps.gateway,
            config.currency.clone(),
            config.tax_rate_bps,
        ));
        let preorders = Arc::new(PreOrderService::new(
            db.clone(),
            links.clone(),
            config.tax_rate_bps,
            config.extra_photo_cents,
        ));
        let jobs: Arc<dyn JobQueue> = Arc::new(TokioJobQueue::new(
            settlement.clone(),
            config.settlement_retry,
        ));

        Ok(Self {
            db,
            base_url: config.base_url.clone(),
            links,
            checkout,
            preorders,
            settlement,
            refunds,
            guard: WebhookIdempotencyGuard::new(deps.event_cache),
            jobs,
            photos: deps.photos,
            stripe_webhooks: Arc::new(StripeWebhookProvider::new(
                config.stripe_webhook_secret.clone(),
            )),
            admin_api_key: config.admin_api_key.clone(),
        })
    }

    pub fn with_job_queue(mut self, jobs: Arc<dyn JobQueue>) -> Self {
        self.jobs = jobs;
        self
    }
}

/// Create a connection pool. Every connection runs in WAL mode with foreign keys
/// enforced and waits on a locked database instead of failing immediately.
pub fn create_pool(database_path: &str) -> Result<DbPool, r2d2::Error> {
    let manager = SqliteConnectionManager::file(database_path).with_init(|conn| {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
    });
    Pool::builder().max_size(10).build(manager)
}
