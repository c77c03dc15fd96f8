//! At-most-once admission for inbound gateway events.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use strum::AsRefStr;

/// Short-lived key store with an atomic insert-if-absent.
pub trait EventCache: Send + Sync {
    /// Mark `key` as seen. Returns true only for the caller that inserted it.
    fn insert_if_absent(&self, key: &str) -> bool;
}

/// In-process TTL cache. Entries expire `ttl` after insertion.
pub struct MokaEventCache {
    cache: Cache<String, i64>,
}

impl MokaEventCache {
    pub fn new(ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(100_000)
            .time_to_live(ttl)
            .build();
        Self { cache }
    }
}

impl EventCache for MokaEventCache {
    fn insert_if_absent(&self, key: &str) -> bool {
        self.cache
            .entry(key.to_string())
            .or_insert(crate::util::now())
            .is_fresh()
    }
}

/// Gateway facts that are deduplicated independently of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    Succeeded,
    Failed,
    Refunded,
}

#[derive(Clone)]
pub struct WebhookIdempotencyGuard {
    cache: Arc<dyn EventCache>,
}

impl WebhookIdempotencyGuard {
    pub fn new(cache: Arc<dyn EventCache>) -> Self {
        Self { cache }
    }

    /// True the first time an (event kind, event id) pair is seen within the TTL.
    pub fn should_process(&self, kind: EventKind, event_id: &str) -> bool {
        let key = format!("webhook_processed:{}:{}", kind.as_ref(), event_id);
        let fresh = self.cache.insert_if_absent(&key);
        if !fresh {
            tracing::info!(event_id, kind = kind.as_ref(), "Duplicate webhook event skipped");
        }
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(ttl: Duration) -> WebhookIdempotencyGuard {
        WebhookIdempotencyGuard::new(Arc::new(MokaEventCache::new(ttl)))
    }

    #[test]
    fn test_second_delivery_is_rejected() {
        let guard = guard(Duration::from_secs(60));
        assert!(guard.should_process(EventKind::Succeeded, "evt_123"));
        assert!(!guard.should_process(EventKind::Succeeded, "evt_123"));
    }

    #[test]
    fn test_kinds_are_namespaced() {
        let guard = guard(Duration::from_secs(60));
        assert!(guard.should_process(EventKind::Succeeded, "evt_1"));
        assert!(guard.should_process(EventKind::Failed, "evt_1"));
        assert!(guard.should_process(EventKind::Refunded, "evt_1"));
        assert!(!guard.should_process(EventKind::Refunded, "evt_1"));
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let guard = guard(Duration::from_millis(50));
        assert!(guard.should_process(EventKind::Succeeded, "evt_ttl"));
        std::thread::sleep(Duration::from_millis(120));
        assert!(guard.should_process(EventKind::Succeeded, "evt_ttl"));
    }
}
