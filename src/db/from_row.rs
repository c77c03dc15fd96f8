//! Row mapping trait and helpers for reducing boilerplate in queries.
//!
//! This module provides a `FromRow` trait that models can implement to
//! define how they are constructed from database rows, plus helper functions
//! for common query patterns.

use rusqlite::{Connection, OptionalExtension, Row, ToSql};

use crate::models::*;

/// Parse a string column into an enum type, converting parse errors to rusqlite errors.
///
/// Invalid stored values surface as a column type error instead of a panic.
fn parse_enum<T: std::str::FromStr>(row: &Row, col: usize, col_name: &str) -> rusqlite::Result<T> {
    row.get::<_, String>(col)?.parse::<T>().map_err(|_| {
        rusqlite::Error::InvalidColumnType(col, col_name.to_string(), rusqlite::types::Type::Text)
    })
}

/// Parse a TEXT column holding a JSON document.
fn parse_json(row: &Row, col: usize, col_name: &str) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(col)?;
    serde_json::from_str(&raw).map_err(|_| {
        rusqlite::Error::InvalidColumnType(col, col_name.to_string(), rusqlite::types::Type::Text)
    })
}

/// Trait for constructing a type from a database row.
///
/// Implementing this trait allows using the `query_one` and `query_all`
/// helper functions, reducing repetitive row mapping closures.
pub trait FromRow: Sized {
    /// Construct an instance from a database row.
    fn from_row(row: &Row) -> rusqlite::Result<Self>;
}

/// Query for a single optional result.
pub fn query_one<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Option<T>> {
    conn.query_row(sql, params, T::from_row)
        .optional()
        .map_err(Into::into)
}

/// Query for multiple results.
pub fn query_all<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, T::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ============ SQL SELECT Constants ============

pub const ORDER_COLS: &str = "id, order_number, buyer_id, seller_id, order_type, status, subtotal_cents, discount_cents, tax_cents, total_cents, currency, package_id, package_photo_count, gallery_id, buyer_email, created_at, updated_at";

pub const ORDER_ITEM_COLS: &str =
    "id, order_id, photo_id, seller_id, filename, unit_price_cents, quantity, total_cents";

pub const TRANSACTION_COLS: &str = "id, order_id, gateway, gateway_transaction_id, amount_cents, refunded_cents, currency, status, metadata, processed_at, created_at, updated_at";

pub const DOWNLOAD_COLS: &str = "id, order_id, photo_id, user_id, secret_hash, download_url, expires_at, attempts, max_attempts, downloaded_at, ip_address, user_agent, created_at, updated_at";

// ============ FromRow Implementations ============

impl FromRow for Order {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Order {
            id: row.get(0)?,
            order_number: row.get(1)?,
            buyer_id: row.get(2)?,
            seller_id: row.get(3)?,
            order_type: parse_enum(row, 4, "order_type")?,
            status: parse_enum(row, 5, "status")?,
            subtotal_cents: row.get(6)?,
            discount_cents: row.get(7)?,
            tax_cents: row.get(8)?,
            total_cents: row.get(9)?,
            currency: row.get(10)?,
            package_id: row.get(11)?,
            package_photo_count: row.get(12)?,
            gallery_id: row.get(13)?,
            buyer_email: row.get(14)?,
            created_at: row.get(15)?,
            updated_at: row.get(16)?,
        })
    }
}

impl FromRow for OrderItem {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(OrderItem {
            id: row.get(0)?,
            order_id: row.get(1)?,
            photo_id: row.get(2)?,
            seller_id: row.get(3)?,
            filename: row.get(4)?,
            unit_price_cents: row.get(5)?,
            quantity: row.get(6)?,
            total_cents: row.get(7)?,
        })
    }
}

impl FromRow for Transaction {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Transaction {
            id: row.get(0)?,
            order_id: row.get(1)?,
            gateway: row.get(2)?,
            gateway_transaction_id: row.get(3)?,
            amount_cents: row.get(4)?,
            refunded_cents: row.get(5)?,
            currency: row.get(6)?,
            status: parse_enum(row, 7, "status")?,
            metadata: parse_json(row, 8, "metadata")?,
            processed_at: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

impl FromRow for Download {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Download {
            id: row.get(0)?,
            order_id: row.get(1)?,
            photo_id: row.get(2)?,
            user_id: row.get(3)?,
            secret_hash: row.get(4)?,
            download_url: row.get(5)?,
            expires_at: row.get(6)?,
            attempts: row.get(7)?,
            max_attempts: row.get(8)?,
            downloaded_at: row.get(9)?,
            ip_address: row.get(10)?,
            user_agent: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }
}
