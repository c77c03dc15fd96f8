//! Operator maintenance: bulk regeneration of download grants.

use crate::db::{DbPool, queries};
use crate::downloads::DownloadLinkManager;
use crate::error::Result;
use crate::util::{days, now};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegenerationOptions {
    /// Only touch grants whose expiry has already passed
    pub expired_only: bool,
    pub order_id: Option<i64>,
    /// Count what would change without writing anything
    pub dry_run: bool,
    pub extend_days: i64,
}

impl Default for RegenerationOptions {
    fn default() -> Self {
        Self {
            expired_only: false,
            order_id: None,
            dry_run: false,
            extend_days: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegenerationSummary {
    pub matched: usize,
    pub regenerated: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Rotate every matching grant: new secret and URL, a fresh expiry
/// `extend_days` from now, attempts reset to zero.
///
/// A failure on one grant is logged and counted; the run continues with the rest.
pub fn regenerate_tokens(
    links: &DownloadLinkManager,
    db: &DbPool,
    opts: &RegenerationOptions,
) -> Result<RegenerationSummary> {
    let started = now();
    let candidates = {
        let conn = db.get()?;
        queries::list_downloads_for_regeneration(
            &conn,
            opts.expired_only.then_some(started),
            opts.order_id,
        )?
    };

    let mut summary = RegenerationSummary {
        matched: candidates.len(),
        ..Default::default()
    };
    tracing::info!(
        matched = summary.matched,
        expired_only = opts.expired_only,
        order_id = ?opts.order_id,
        dry_run = opts.dry_run,
        "Regenerating download tokens"
    );

    if opts.dry_run {
        summary.skipped = summary.matched;
        return Ok(summary);
    }

    let expires_at = started + days(opts.extend_days.max(1));
    for download in candidates {
        match links.regenerate(download.id, expires_at) {
            Ok(_) => summary.regenerated += 1,
            Err(e) => {
                tracing::error!(download_id = download.id, error = %e, "Failed to regenerate download token");
                summary.errors += 1;
            }
        }
    }

    tracing::info!(
        regenerated = summary.regenerated,
        errors = summary.errors,
        "Download token regeneration finished"
    );
    Ok(summary)
}
