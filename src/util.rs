//! Shared utility functions.

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};

pub const SECONDS_PER_DAY: i64 = 86400;

/// Current Unix timestamp in seconds.
pub fn now() -> i64 {
    Utc::now().timestamp()
}

/// Convert a number of days into seconds.
pub fn days(n: i64) -> i64 {
    n * SECONDS_PER_DAY
}

/// Convert a stored Unix timestamp into a `DateTime`, clamping invalid values to the epoch.
pub fn to_datetime(timestamp: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(timestamp, 0).unwrap_or_default()
}

/// Format a Unix timestamp as a human-readable date (e.g., "Jan 15, 2024")
pub fn format_date(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%b %d, %Y").to_string())
        .unwrap_or_else(|| "Unknown date".to_string())
}

/// Format an amount in minor units for display (e.g., "100.00 USD").
pub fn format_money(cents: i64, currency: &str) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.abs();
    format!(
        "{}{}.{:02} {}",
        sign,
        cents / 100,
        cents % 100,
        currency.to_uppercase()
    )
}

/// Extract client IP address and user-agent from request headers.
///
/// Tries `x-forwarded-for` first (for proxied requests), then `x-real-ip`.
/// Only the first hop of a forwarded chain is kept.
pub fn extract_request_info(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let ip = headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    (ip, user_agent)
}

/// Extract a Bearer token from the Authorization header.
///
/// Returns the token string without the "Bearer " prefix, or None if
/// the header is missing, malformed, or empty after the prefix.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
}
