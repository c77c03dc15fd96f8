pub mod downloads;
pub mod orders;
pub mod webhooks;

use axum::{Json, Router, routing::get};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::config::RateLimitConfig;
use crate::db::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Build the full application router.
pub fn app(state: AppState, limits: RateLimitConfig) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(downloads::router(limits.download_rpm))
        .merge(webhooks::router(limits.webhook_rpm))
        .merge(orders::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
