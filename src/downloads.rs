//! Download grants: issuance, refresh, validation and attempt accounting.
//!
//! Each (order, photo, buyer) triple owns exactly one grant row. The grant's
//! secret is embedded in a signed `single` token and stored only as a hash, so a
//! leaked database cannot mint working links and a tampered token never reaches
//! the database lookup.

use std::collections::{HashMap, HashSet};

use rusqlite::Connection;
use thiserror::Error;

use crate::config::DownloadPolicy;
use crate::crypto::{generate_secret, hash_secret, secret_matches};
use crate::db::{DbPool, queries};
use crate::error::{AppError, Result, msg};
use crate::models::{Download, NewDownload, Order};
use crate::token::{TokenCodec, TokenPayload};
use crate::util::{now, to_datetime};

/// Why a link was refused. Invalid covers tampering, unknown ids and wrong
/// secrets alike so callers cannot tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("download link is invalid")]
    Invalid,

    #[error("download link has expired")]
    Expired,

    #[error("download attempts exhausted")]
    Exhausted,
}

impl Rejection {
    pub fn user_message(&self) -> &'static str {
        match self {
            Rejection::Invalid => msg::LINK_UNAVAILABLE,
            Rejection::Expired | Rejection::Exhausted => msg::LINK_EXPIRED,
        }
    }
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error(transparent)]
    Internal(#[from] AppError),
}

impl From<r2d2::Error> for AccessError {
    fn from(e: r2d2::Error) -> Self {
        AccessError::Internal(e.into())
    }
}

#[derive(Clone)]
pub struct DownloadLinkManager {
    db: DbPool,
    codec: TokenCodec,
    policy: DownloadPolicy,
    base_url: String,
}

impl DownloadLinkManager {
    pub fn new(db: DbPool, codec: TokenCodec, policy: DownloadPolicy, base_url: String) -> Self {
        Self {
            db,
            codec,
            policy,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn policy(&self) -> DownloadPolicy {
        self.policy
    }

    /// Make sure the order's buyer holds a usable grant for `photo_id`.
    ///
    /// Missing grants are created. Expired grants are rotated (new secret, new URL,
    /// attempts reset). Grants inside the grace window get a later expiry but keep
    /// their secret and URL, so links already sent to the buyer keep working.
    pub fn ensure(&self, order: &Order, photo_id: i64) -> Result<Download> {
        let mut conn = self.db.get()?;
        let now = now();
        match queries::get_download_for(&conn, order.id, photo_id, order.buyer_id)? {
            Some(existing) => self.refresh(&conn, existing, now),
            None => self.issue(&mut conn, order, photo_id, now),
        }
    }

    /// `ensure` for every purchased photo, reading existing grants in one query.
    pub fn ensure_all(&self, order: &Order) -> Result<Vec<Download>> {
        let mut conn = self.db.get()?;
        let now = now();
        let items = queries::list_order_items(&conn, order.id)?;
        let mut existing: HashMap<i64, Download> =
            queries::list_downloads_for_order_user(&conn, order.id, order.buyer_id)?
                .into_iter()
                .map(|d| (d.photo_id, d))
                .collect();

        let mut seen = HashSet::new();
        let mut grants = Vec::with_capacity(items.len());
        for item in items {
            if !seen.insert(item.photo_id) {
                continue;
            }
            let grant = match existing.remove(&item.photo_id) {
                Some(download) => self.refresh(&conn, download, now)?,
                None => self.issue(&mut conn, order, item.photo_id, now)?,
            };
            grants.push(grant);
        }

        tracing::debug!(
            order_id = order.id,
            grants = grants.len(),
            "Download grants ensured for order"
        );
        Ok(grants)
    }

    /// Validate a `single` token and return its grant.
    ///
    /// The stored expiry wins over the one embedded in the token, so regenerating
    /// or expiring a grant server-side takes effect immediately.
    pub fn resolve(&self, token: &str) -> std::result::Result<Download, AccessError> {
        let payload = self.codec.decode(token).map_err(|e| {
            tracing::debug!("Download token rejected: {}", e);
            Rejection::Invalid
        })?;
        let TokenPayload::Single {
            download_id, secret, ..
        } = payload
        else {
            return Err(Rejection::Invalid.into());
        };

        let conn = self.db.get()?;
        let download = queries::get_download_by_id(&conn, download_id)?.ok_or(Rejection::Invalid)?;

        if !secret_matches(&secret, &download.secret_hash) {
            tracing::warn!(download_id, "Download token secret mismatch");
            return Err(Rejection::Invalid.into());
        }
        if download.is_expired(now()) {
            return Err(Rejection::Expired.into());
        }
        if download.is_exhausted() {
            return Err(Rejection::Exhausted.into());
        }
        Ok(download)
    }

    /// Validate a `batch` token and return the order it unlocks.
    ///
    /// Batch tokens have no grant row, so the embedded expiry is enforced here.
    pub fn resolve_batch(&self, token: &str) -> std::result::Result<Order, AccessError> {
        let payload = self.codec.decode(token).map_err(|e| {
            tracing::debug!("Batch token rejected: {}", e);
            Rejection::Invalid
        })?;
        let TokenPayload::Batch {
            order_id,
            user_id,
            expires_at,
        } = payload
        else {
            return Err(Rejection::Invalid.into());
        };

        if now() > expires_at.timestamp() {
            return Err(Rejection::Expired.into());
        }

        let conn = self.db.get()?;
        let order = queries::get_order_by_id(&conn, order_id)?.ok_or(Rejection::Invalid)?;
        if order.buyer_id != user_id || !order.status.grants_access() {
            return Err(Rejection::Invalid.into());
        }
        Ok(order)
    }

    /// Consume one attempt and record who downloaded.
    ///
    /// Returns the new attempt count, or None when a concurrent request used the
    /// last attempt first.
    pub fn record_attempt(
        &self,
        download_id: i64,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<Option<i64>> {
        let conn = self.db.get()?;
        let Some(attempts) = queries::increment_download_attempts(&conn, download_id)? else {
            return Ok(None);
        };
        queries::record_download_metadata(&conn, download_id, ip_address, user_agent, now())?;
        tracing::info!(download_id, attempts, "Download attempt recorded");
        Ok(Some(attempts))
    }

    /// Grant to hand out as-is, extended first when inside the grace window.
    /// The returned row carries the expiry the buyer will actually see.
    pub fn current_url(&self, download: &Download) -> std::result::Result<Download, AccessError> {
        let now = now();
        if download.is_expired(now) {
            return Err(Rejection::Expired.into());
        }
        if !self.within_grace(download, now) {
            return Ok(download.clone());
        }
        let conn = self.db.get()?;
        let extended =
            queries::extend_download_expiry(&conn, download.id, now + self.policy.lifetime_secs)?
                .ok_or(Rejection::Invalid)?;
        Ok(extended)
    }

    /// Signed link to the whole order's archive.
    pub fn batch_url(&self, order: &Order) -> Result<String> {
        let payload = TokenPayload::Batch {
            order_id: order.id,
            user_id: order.buyer_id,
            expires_at: to_datetime(now() + self.policy.lifetime_secs),
        };
        let token = self.encode(&payload)?;
        Ok(format!("{}/download/batch/{}", self.base_url, token))
    }

    /// Rotate a grant: new secret and URL, given expiry, attempts reset.
    pub fn regenerate(&self, download_id: i64, expires_at: i64) -> Result<Download> {
        let conn = self.db.get()?;
        self.rotate(&conn, download_id, expires_at)
    }

    fn issue(
        &self,
        conn: &mut Connection,
        order: &Order,
        photo_id: i64,
        now: i64,
    ) -> Result<Download> {
        let secret = generate_secret();
        let expires_at = now + self.policy.lifetime_secs;
        let tx = conn.transaction()?;
        let inserted = queries::insert_download_if_absent(
            &tx,
            &NewDownload {
                order_id: order.id,
                photo_id,
                user_id: order.buyer_id,
                secret_hash: hash_secret(&secret),
                expires_at,
                max_attempts: self.policy.max_attempts,
            },
        )?;

        let Some(id) = inserted else {
            // Lost the race to a concurrent issuer; their row is the grant.
            tx.commit()?;
            let winner = queries::get_download_for(conn, order.id, photo_id, order.buyer_id)?
                .ok_or_else(|| AppError::Internal("download grant vanished after conflict".into()))?;
            return self.refresh(conn, winner, now);
        };

        let url = self.single_url(id, &secret, expires_at)?;
        let download = queries::set_download_url(&tx, id, &url)?
            .ok_or_else(|| AppError::Internal("download grant missing after insert".into()))?;
        tx.commit()?;

        tracing::info!(
            order_id = order.id,
            photo_id,
            download_id = id,
            "Download grant issued"
        );
        Ok(download)
    }

    fn refresh(&self, conn: &Connection, download: Download, now: i64) -> Result<Download> {
        if download.is_expired(now) {
            tracing::info!(download_id = download.id, "Regenerating expired download grant");
            return self.rotate(conn, download.id, now + self.policy.lifetime_secs);
        }
        if self.within_grace(&download, now) {
            tracing::debug!(download_id = download.id, "Extending download grant near expiry");
            return queries::extend_download_expiry(conn, download.id, now + self.policy.lifetime_secs)?
                .ok_or_else(|| AppError::NotFound("Download not found".into()));
        }
        Ok(download)
    }

    fn rotate(&self, conn: &Connection, download_id: i64, expires_at: i64) -> Result<Download> {
        let secret = generate_secret();
        let url = self.single_url(download_id, &secret, expires_at)?;
        queries::regenerate_download(conn, download_id, &hash_secret(&secret), &url, expires_at)?
            .ok_or_else(|| AppError::NotFound("Download not found".into()))
    }

    fn within_grace(&self, download: &Download, now: i64) -> bool {
        self.policy.in_grace_window(download.expires_at, now)
    }

    fn single_url(&self, download_id: i64, secret: &str, expires_at: i64) -> Result<String> {
        let payload = TokenPayload::Single {
            download_id,
            secret: secret.to_string(),
            expires_at: to_datetime(expires_at),
        };
        let token = self.encode(&payload)?;
        Ok(format!("{}/download/{}", self.base_url, token))
    }

    fn encode(&self, payload: &TokenPayload) -> Result<String> {
        self.codec
            .encode(payload)
            .map_err(|e| AppError::Internal(format!("Failed to sign download token: {}", e)))
    }
}
