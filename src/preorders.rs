//! Pre-order photo selection and finalization.

use std::collections::HashSet;

use rusqlite::TransactionBehavior;
use serde::Deserialize;

use crate::db::{DbPool, queries};
use crate::downloads::DownloadLinkManager;
use crate::error::{AppError, Result, msg};
use crate::models::{CreateOrderItem, Order, OrderItem, OrderStatus, OrderTotals, OrderType};
use crate::orders;

/// A photo the buyer picked from the gallery.
#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSelection {
    pub photo_id: i64,
    pub filename: String,
}

/// Extra charge for photos beyond the package allowance.
pub fn upsell_cents(package_photo_count: i64, selected: i64, extra_photo_cents: i64) -> i64 {
    (selected - package_photo_count).max(0) * extra_photo_cents
}

pub struct PreOrderService {
    db: DbPool,
    links: DownloadLinkManager,
    tax_rate_bps: i64,
    extra_photo_cents: i64,
}

impl PreOrderService {
    pub fn new(
        db: DbPool,
        links: DownloadLinkManager,
        tax_rate_bps: i64,
        extra_photo_cents: i64,
    ) -> Self {
        Self {
            db,
            links,
            tax_rate_bps,
            extra_photo_cents,
        }
    }

    /// Open a paid pre-order for photo selection from `gallery_id`.
    pub fn begin_selection(&self, order_id: i64, gallery_id: i64) -> Result<Order> {
        let mut conn = self.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let order = load_pre_order(&tx, order_id)?;

        let order = orders::transition(&tx, &order, OrderStatus::PreOrderSelecting)?;
        let order = queries::set_order_gallery(&tx, order.id, gallery_id)?
            .ok_or_else(|| AppError::NotFound(msg::ORDER_NOT_FOUND.into()))?;
        tx.commit()?;

        tracing::info!(order_id, gallery_id, "Pre-order selection started");
        Ok(order)
    }

    /// Record the buyer's selection, recompute totals and finalize the order.
    ///
    /// Photos beyond the package allowance are priced at the extra-photo rate and
    /// added to the order total. Grants for every selected photo are issued once
    /// the order is finalized.
    pub fn finalize(
        &self,
        order_id: i64,
        selections: Vec<PhotoSelection>,
    ) -> Result<(Order, Vec<OrderItem>)> {
        let mut seen = HashSet::new();
        let selections: Vec<PhotoSelection> = selections
            .into_iter()
            .filter(|s| seen.insert(s.photo_id))
            .collect();

        let mut conn = self.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let order = load_pre_order(&tx, order_id)?;
        if order.status != OrderStatus::PreOrderSelecting {
            return Err(AppError::Conflict(
                "Pre-order is not open for photo selection".into(),
            ));
        }

        let included = order.package_photo_count.unwrap_or(0);
        let selected = selections.len() as i64;
        if selected < included {
            return Err(AppError::BadRequest(format!(
                "Package requires at least {} photos, but only {} were selected",
                included, selected
            )));
        }

        let items = selections
            .iter()
            .enumerate()
            .map(|(idx, selection)| {
                let unit_price_cents = if (idx as i64) < included {
                    0
                } else {
                    self.extra_photo_cents
                };
                queries::create_order_item(
                    &tx,
                    order.id,
                    &CreateOrderItem {
                        photo_id: selection.photo_id,
                        seller_id: order.seller_id,
                        filename: selection.filename.clone(),
                        unit_price_cents,
                        quantity: 1,
                    },
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let upsell = upsell_cents(included, selected, self.extra_photo_cents);
        let totals = OrderTotals::compute(
            order.subtotal_cents + upsell,
            order.discount_cents,
            self.tax_rate_bps,
        );
        let order = queries::update_order_totals(&tx, order.id, OrderStatus::PreOrderSelecting, &totals)?
            .ok_or_else(|| AppError::Conflict("Pre-order changed during finalization".into()))?;
        let order = orders::transition(&tx, &order, OrderStatus::PreOrderFinalized)?;
        tx.commit()?;

        tracing::info!(
            order_id,
            selected,
            upsell_cents = upsell,
            total_cents = order.total_cents,
            "Pre-order finalized"
        );

        if let Err(e) = self.links.ensure_all(&order) {
            tracing::error!(order_id, error = %e, "Failed to issue download grants for pre-order");
        }
        Ok((order, items))
    }
}

fn load_pre_order(conn: &rusqlite::Connection, order_id: i64) -> Result<Order> {
    let order = queries::get_order_by_id(conn, order_id)?
        .ok_or_else(|| AppError::NotFound(msg::ORDER_NOT_FOUND.into()))?;
    if order.order_type != OrderType::PreOrder {
        return Err(AppError::BadRequest("Order is not a pre-order".into()));
    }
    Ok(order)
}
