//! Per-IP rate limiting for public endpoints.
//!
//! Download links are bearer capabilities, so the download routes get a tighter
//! limit than webhooks. A limit of 0 disables the layer (used by tests and by
//! deployments that rate limit at the proxy).

use std::sync::Arc;
use std::time::Duration;
use tower_governor::GovernorLayer;
use tower_governor::governor::GovernorConfigBuilder;

/// Rate limiter layer type alias using governor types directly
pub type RateLimitLayer = GovernorLayer<
    tower_governor::key_extractor::PeerIpKeyExtractor,
    governor::middleware::NoOpMiddleware<governor::clock::QuantaInstant>,
    axum::body::Body,
>;

/// Creates a rate limiter layer allowing `requests_per_minute` per client IP,
/// or None when the limit is 0.
pub fn layer(requests_per_minute: u32) -> Option<RateLimitLayer> {
    if requests_per_minute == 0 {
        return None;
    }

    let period_ms = (60_000 / requests_per_minute as u64).max(1);
    let config = GovernorConfigBuilder::default()
        .period(Duration::from_millis(period_ms))
        .burst_size(requests_per_minute)
        .finish()?;

    Some(GovernorLayer::new(Arc::new(config)))
}
