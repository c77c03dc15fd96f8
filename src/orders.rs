//! Order status graphs and the single place where order status changes.
//!
//! Direct orders: `pending -> processing -> completed`, with `cancelled` and
//! `refunded` reachable before completion and `refunded` also after it.
//! Pre-orders: `pre_order_pending -> pre_order_paid -> pre_order_selecting ->
//! pre_order_finalized`, refundable from any non-finalized state.
//!
//! Every change is a compare-and-set on the stored status, so two writers racing
//! on the same order cannot both apply a transition from the same predecessor.

use rusqlite::Connection;
use thiserror::Error;

use crate::db::queries;
use crate::error::AppError;
use crate::models::{Order, OrderStatus, OrderType};

const DIRECT_CHAIN: [OrderStatus; 3] = [
    OrderStatus::Pending,
    OrderStatus::Processing,
    OrderStatus::Completed,
];

const PRE_ORDER_CHAIN: [OrderStatus; 4] = [
    OrderStatus::PreOrderPending,
    OrderStatus::PreOrderPaid,
    OrderStatus::PreOrderSelecting,
    OrderStatus::PreOrderFinalized,
];

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("cannot move {order_type} order from {from} to {to}")]
    Illegal {
        order_type: OrderType,
        from: OrderStatus,
        to: OrderStatus,
    },

    /// The stored status changed between read and write.
    #[error("order status changed concurrently")]
    Stale,

    #[error(transparent)]
    Storage(#[from] AppError),
}

impl From<TransitionError> for AppError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::Illegal { .. } => AppError::Conflict(err.to_string()),
            TransitionError::Stale => AppError::Conflict(err.to_string()),
            TransitionError::Storage(e) => e,
        }
    }
}

fn chain(order_type: OrderType) -> &'static [OrderStatus] {
    match order_type {
        OrderType::Direct => &DIRECT_CHAIN,
        OrderType::PreOrder => &PRE_ORDER_CHAIN,
    }
}

/// Status a successful payment moves an order of this type to.
pub fn paid_target(order_type: OrderType) -> OrderStatus {
    match order_type {
        OrderType::Direct => OrderStatus::Processing,
        OrderType::PreOrder => OrderStatus::PreOrderPaid,
    }
}

/// Whether `status` belongs to the graph of `order_type`.
pub fn is_consistent(order_type: OrderType, status: OrderStatus) -> bool {
    status.is_terminal() || chain(order_type).contains(&status)
}

/// Map a status onto the nearest equivalent in the order type's graph.
pub fn normalize(order_type: OrderType, status: OrderStatus) -> OrderStatus {
    use OrderStatus::*;
    match (order_type, status) {
        (OrderType::Direct, PreOrderPending) => Pending,
        (OrderType::Direct, PreOrderPaid | PreOrderSelecting) => Processing,
        (OrderType::Direct, PreOrderFinalized) => Completed,
        (OrderType::PreOrder, Pending) => PreOrderPending,
        (OrderType::PreOrder, Processing) => PreOrderPaid,
        (OrderType::PreOrder, Completed) => PreOrderFinalized,
        (_, status) => status,
    }
}

/// Whether `from -> to` is an edge of the graph for `order_type`.
pub fn can_transition(order_type: OrderType, from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;
    match order_type {
        OrderType::Direct => matches!(
            (from, to),
            (Pending, Processing)
                | (Processing, Completed)
                | (Pending | Processing, Cancelled)
                | (Pending | Processing, Refunded)
        ),
        OrderType::PreOrder => matches!(
            (from, to),
            (PreOrderPending, PreOrderPaid)
                | (PreOrderPaid, PreOrderSelecting)
                | (PreOrderSelecting, PreOrderFinalized)
                | (PreOrderPending | PreOrderPaid | PreOrderSelecting, Refunded)
        ),
    }
}

fn effective_status(order: &Order) -> OrderStatus {
    let normalized = normalize(order.order_type, order.status);
    if normalized != order.status {
        tracing::warn!(
            order_id = order.id,
            order_type = %order.order_type,
            status = %order.status,
            normalized = %normalized,
            "Order status does not match its type"
        );
    }
    normalized
}

/// Apply one transition. The check runs against the normalised status; the
/// compare-and-set runs against the raw stored status, so an inconsistent row
/// is repaired by the same write.
pub fn transition(
    conn: &Connection,
    order: &Order,
    to: OrderStatus,
) -> Result<Order, TransitionError> {
    let from = effective_status(order);
    if !can_transition(order.order_type, from, to) {
        return Err(TransitionError::Illegal {
            order_type: order.order_type,
            from,
            to,
        });
    }

    let updated = queries::transition_order_status(conn, order.id, order.status, to)?
        .ok_or(TransitionError::Stale)?;
    tracing::info!(
        order_id = order.id,
        from = %order.status,
        to = %to,
        "Order status changed"
    );
    Ok(updated)
}

/// Walk the forward chain until the order reaches `target`.
///
/// Orders already at or past `target` are returned unchanged, which keeps
/// settlement re-entrant. Terminal orders and targets off the chain are illegal.
pub fn advance_to(
    conn: &Connection,
    order: &Order,
    target: OrderStatus,
) -> Result<Order, TransitionError> {
    let steps = chain(order.order_type);
    let current = effective_status(order);
    let illegal = || TransitionError::Illegal {
        order_type: order.order_type,
        from: current,
        to: target,
    };

    let target_idx = steps.iter().position(|s| *s == target).ok_or_else(illegal)?;
    let current_idx = steps.iter().position(|s| *s == current).ok_or_else(illegal)?;

    if current_idx >= target_idx {
        if current != order.status {
            // Already far enough along, but stored under the wrong graph.
            return queries::transition_order_status(conn, order.id, order.status, current)?
                .ok_or(TransitionError::Stale);
        }
        return Ok(order.clone());
    }

    let mut order = order.clone();
    for next in &steps[current_idx + 1..=target_idx] {
        order = transition(conn, &order, *next)?;
    }
    Ok(order)
}
