use serde::{Deserialize, Serialize};

/// Per-photo download grant for a buyer. Unique on (order, photo, user).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Download {
    pub id: i64,
    pub order_id: i64,
    pub photo_id: i64,
    pub user_id: i64,
    /// Hash of the token secret; the plaintext is never stored
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub download_url: String,
    pub expires_at: i64,
    pub attempts: i64,
    pub max_attempts: i64,
    pub downloaded_at: Option<i64>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Download {
    /// Expired once `now` is past `expires_at`; the expiry second itself still counts.
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn remaining_attempts(&self) -> i64 {
        (self.max_attempts - self.attempts).max(0)
    }
}

/// Insert payload for a new grant.
#[derive(Debug, Clone)]
pub struct NewDownload {
    pub order_id: i64,
    pub photo_id: i64,
    pub user_id: i64,
    pub secret_hash: String,
    pub expires_at: i64,
    pub max_attempts: i64,
}
