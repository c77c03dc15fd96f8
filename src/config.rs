use std::env;
use std::str::FromStr;
use std::time::Duration;

use backon::ExponentialBuilder;
use thiserror::Error;

use crate::util::days;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} has an invalid value: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Lifetime and attempt limits for download grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadPolicy {
    /// Seconds a freshly issued or regenerated grant stays valid
    pub lifetime_secs: i64,
    /// Grants expiring within this many seconds are extended instead of left alone
    pub grace_secs: i64,
    pub max_attempts: i64,
}

impl DownloadPolicy {
    /// Whether a grant expiring at `expires_at` is close enough to be extended.
    pub fn in_grace_window(&self, expires_at: i64, now: i64) -> bool {
        expires_at - now < self.grace_secs
    }
}

impl Default for DownloadPolicy {
    fn default() -> Self {
        Self {
            lifetime_secs: days(7),
            grace_secs: days(2),
            max_attempts: 3,
        }
    }
}

/// Bounded exponential retry used for background jobs and transient gateway failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Settlement jobs: 3 retries starting at 60 seconds.
    pub fn settlement() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(15 * 60),
        }
    }

    /// Inline gateway calls (refunds): short delays, the caller is waiting.
    pub fn gateway() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(4),
        }
    }

    /// Receipt email: 3 retries, 1s doubling up to 16s.
    pub fn email() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(16),
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_max_times(self.max_retries)
    }
}

/// Per-IP rate limits in requests per minute. Zero disables the limiter for that tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub download_rpm: u32,
    pub webhook_rpm: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            download_rpm: 30,
            webhook_rpm: 120,
        }
    }
}

impl RateLimitConfig {
    pub fn disabled() -> Self {
        Self {
            download_rpm: 0,
            webhook_rpm: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    pub base_url: String,
    /// Token signing key. A `base64:` prefix marks an encoded key.
    pub app_key: String,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub currency: String,
    pub gateway_timeout: Duration,
    pub downloads: DownloadPolicy,
    pub settlement_retry: RetryPolicy,
    pub gateway_retry: RetryPolicy,
    pub webhook_dedup_ttl: Duration,
    /// Tax rate in basis points (800 = 8%)
    pub tax_rate_bps: i64,
    /// Price of each photo selected beyond a pre-order package allowance
    pub extra_photo_cents: i64,
    pub admin_api_key: Option<String>,
    pub resend_api_key: Option<String>,
    pub email_from: String,
    pub storage_root: String,
    pub rate_limit: RateLimitConfig,
    pub dev_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            database_path: "shutterpay.db".to_string(),
            base_url: "http://127.0.0.1:3000".to_string(),
            app_key: String::new(),
            stripe_secret_key: None,
            stripe_webhook_secret: None,
            currency: "usd".to_string(),
            gateway_timeout: Duration::from_secs(30),
            downloads: DownloadPolicy::default(),
            settlement_retry: RetryPolicy::settlement(),
            gateway_retry: RetryPolicy::gateway(),
            // Stripe retries for up to 24 hours; keep dedup entries for twice that.
            webhook_dedup_ttl: Duration::from_secs(48 * 3600),
            tax_rate_bps: 800,
            extra_photo_cents: 500,
            admin_api_key: None,
            resend_api_key: None,
            email_from: "receipts@shutterpay.local".to_string(),
            storage_root: "storage".to_string(),
            rate_limit: RateLimitConfig::default(),
            dev_mode: false,
        }
    }
}

fn parse_var<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        _ => Ok(default),
    }
}

fn optional_var(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let dev_mode = env::var("SHUTTERPAY_ENV")
            .map(|v| v == "dev" || v == "development")
            .unwrap_or(false);

        let host = env::var("HOST").unwrap_or(defaults.host);
        let port: u16 = parse_var("PORT", defaults.port)?;

        let base_url = env::var("BASE_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|_| format!("http://{}:{}", host, port));

        let app_key = optional_var("APP_KEY").ok_or(ConfigError::Missing("APP_KEY"))?;

        let downloads = DownloadPolicy {
            lifetime_secs: days(parse_var("DOWNLOAD_EXPIRATION_DAYS", 7)?),
            grace_secs: days(parse_var("DOWNLOAD_GRACE_DAYS", 2)?),
            max_attempts: parse_var("DOWNLOAD_MAX_ATTEMPTS", defaults.downloads.max_attempts)?,
        };
        if downloads.lifetime_secs <= 0 || downloads.max_attempts <= 0 {
            return Err(ConfigError::Invalid {
                var: "DOWNLOAD_EXPIRATION_DAYS/DOWNLOAD_MAX_ATTEMPTS",
                value: "must be positive".to_string(),
            });
        }

        let settlement_retry = RetryPolicy {
            max_retries: parse_var("SETTLEMENT_MAX_RETRIES", defaults.settlement_retry.max_retries)?,
            initial_backoff: Duration::from_secs(parse_var("SETTLEMENT_BACKOFF_SECS", 60)?),
            ..defaults.settlement_retry
        };

        Ok(Self {
            host,
            port,
            database_path: env::var("DATABASE_PATH").unwrap_or(defaults.database_path),
            base_url,
            app_key,
            stripe_secret_key: optional_var("STRIPE_SECRET_KEY"),
            stripe_webhook_secret: optional_var("STRIPE_WEBHOOK_SECRET"),
            currency: env::var("STRIPE_CURRENCY")
                .map(|c| c.to_lowercase())
                .unwrap_or(defaults.currency),
            gateway_timeout: Duration::from_secs(parse_var("GATEWAY_TIMEOUT_SECS", 30)?),
            downloads,
            settlement_retry,
            gateway_retry: defaults.gateway_retry,
            webhook_dedup_ttl: Duration::from_secs(
                parse_var::<u64>("WEBHOOK_DEDUP_TTL_HOURS", 48)? * 3600,
            ),
            tax_rate_bps: parse_var("TAX_RATE_BPS", defaults.tax_rate_bps)?,
            extra_photo_cents: parse_var("PREORDER_EXTRA_PHOTO_CENTS", defaults.extra_photo_cents)?,
            admin_api_key: optional_var("ADMIN_API_KEY"),
            resend_api_key: optional_var("RESEND_API_KEY"),
            email_from: env::var("EMAIL_FROM").unwrap_or(defaults.email_from),
            storage_root: env::var("STORAGE_ROOT").unwrap_or(defaults.storage_root),
            rate_limit: RateLimitConfig {
                download_rpm: parse_var("RATE_LIMIT_DOWNLOAD_RPM", defaults.rate_limit.download_rpm)?,
                webhook_rpm: parse_var("RATE_LIMIT_WEBHOOK_RPM", defaults.rate_limit.webhook_rpm)?,
            },
            dev_mode,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
