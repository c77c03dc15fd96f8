use rusqlite::{Connection, OptionalExtension, params, types::Value};

use crate::error::{AppError, Result};
use crate::models::*;
use crate::util::now;

use super::from_row::{
    DOWNLOAD_COLS, FromRow, ORDER_COLS, ORDER_ITEM_COLS, TRANSACTION_COLS, query_all, query_one,
};

/// Builder for dynamic UPDATE statements with optional fields.
/// Combines multiple field updates into a single query, optionally guarded by a
/// compare-and-set condition on another column.
struct UpdateBuilder {
    table: &'static str,
    id: i64,
    fields: Vec<(&'static str, Value)>,
    guard: Option<(&'static str, Value)>,
    track_updated_at: bool,
}

impl UpdateBuilder {
    fn new(table: &'static str, id: i64) -> Self {
        Self {
            table,
            id,
            fields: Vec::new(),
            guard: None,
            track_updated_at: false,
        }
    }

    fn with_updated_at(mut self) -> Self {
        self.track_updated_at = true;
        self
    }

    fn set(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.fields.push((column, value.into()));
        self
    }

    fn set_opt<V: Into<Value>>(self, column: &'static str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.set(column, v),
            None => self,
        }
    }

    /// Only apply the update when `column` currently equals `value`.
    fn guard(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.guard = Some((column, value.into()));
        self
    }

    /// Execute the update and return the updated entity using RETURNING clause.
    /// Returns None if no rows matched (missing entity or failed guard).
    fn execute_returning<T: FromRow>(
        mut self,
        conn: &Connection,
        returning_cols: &str,
    ) -> Result<Option<T>> {
        if self.fields.is_empty() {
            return Ok(None);
        }
        if self.track_updated_at {
            self.fields.push(("updated_at", now().into()));
        }
        let sets: Vec<String> = self
            .fields
            .iter()
            .map(|(col, _)| format!("{} = ?", col))
            .collect();
        let mut values: Vec<Value> = self.fields.into_iter().map(|(_, v)| v).collect();
        values.push(self.id.into());
        let guard_sql = match self.guard {
            Some((col, value)) => {
                values.push(value);
                format!(" AND {} = ?", col)
            }
            None => String::new(),
        };
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?{} RETURNING {}",
            self.table,
            sets.join(", "),
            guard_sql,
            returning_cols
        );
        conn.query_row(&sql, rusqlite::params_from_iter(values), T::from_row)
            .optional()
            .map_err(Into::into)
    }
}

// ============ Orders ============

pub fn create_order(conn: &Connection, input: &NewOrder) -> Result<Order> {
    let now = now();
    let id = conn.query_row(
        "INSERT INTO orders (order_number, buyer_id, seller_id, order_type, status,
            subtotal_cents, discount_cents, tax_cents, total_cents, currency,
            package_id, package_photo_count, buyer_email, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
         RETURNING id",
        params![
            &input.order_number,
            input.buyer_id,
            input.seller_id,
            input.order_type.as_ref(),
            input.status.as_ref(),
            input.totals.subtotal_cents,
            input.totals.discount_cents,
            input.totals.tax_cents,
            input.totals.total_cents,
            &input.currency,
            input.package_id,
            input.package_photo_count,
            &input.buyer_email,
            now,
        ],
        |row| row.get::<_, i64>(0),
    )?;

    Ok(Order {
        id,
        order_number: input.order_number.clone(),
        buyer_id: input.buyer_id,
        seller_id: input.seller_id,
        order_type: input.order_type,
        status: input.status,
        subtotal_cents: input.totals.subtotal_cents,
        discount_cents: input.totals.discount_cents,
        tax_cents: input.totals.tax_cents,
        total_cents: input.totals.total_cents,
        currency: input.currency.clone(),
        package_id: input.package_id,
        package_photo_count: input.package_photo_count,
        gallery_id: None,
        buyer_email: input.buyer_email.clone(),
        created_at: now,
        updated_at: now,
    })
}

pub fn get_order_by_id(conn: &Connection, id: i64) -> Result<Option<Order>> {
    query_one(
        conn,
        &format!("SELECT {} FROM orders WHERE id = ?1", ORDER_COLS),
        &[&id],
    )
}

/// Highest order number starting with `prefix` (e.g. `ORD-20240115-`).
pub fn last_order_number_with_prefix(conn: &Connection, prefix: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT order_number FROM orders WHERE order_number LIKE ?1 || '%'
         ORDER BY order_number DESC LIMIT 1",
        params![prefix],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(Into::into)
}

/// Compare-and-set the order status. Returns None when the stored status no
/// longer equals `from` (another writer got there first) or the order is gone.
pub fn transition_order_status(
    conn: &Connection,
    id: i64,
    from: OrderStatus,
    to: OrderStatus,
) -> Result<Option<Order>> {
    UpdateBuilder::new("orders", id)
        .with_updated_at()
        .set("status", to.as_ref().to_string())
        .guard("status", from.as_ref().to_string())
        .execute_returning(conn, ORDER_COLS)
}

/// Record the gallery a pre-order selects from.
pub fn set_order_gallery(conn: &Connection, id: i64, gallery_id: i64) -> Result<Option<Order>> {
    UpdateBuilder::new("orders", id)
        .with_updated_at()
        .set("gallery_id", gallery_id)
        .execute_returning(conn, ORDER_COLS)
}

/// Replace order totals (pre-order finalization), guarded on the expected status.
pub fn update_order_totals(
    conn: &Connection,
    id: i64,
    expected: OrderStatus,
    totals: &OrderTotals,
) -> Result<Option<Order>> {
    UpdateBuilder::new("orders", id)
        .with_updated_at()
        .set("subtotal_cents", totals.subtotal_cents)
        .set("discount_cents", totals.discount_cents)
        .set("tax_cents", totals.tax_cents)
        .set("total_cents", totals.total_cents)
        .guard("status", expected.as_ref().to_string())
        .execute_returning(conn, ORDER_COLS)
}

// ============ Order Items ============

pub fn create_order_item(
    conn: &Connection,
    order_id: i64,
    item: &CreateOrderItem,
) -> Result<OrderItem> {
    let total_cents = item.unit_price_cents * item.quantity;
    let id = conn.query_row(
        "INSERT INTO order_items (order_id, photo_id, seller_id, filename, unit_price_cents, quantity, total_cents)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         RETURNING id",
        params![
            order_id,
            item.photo_id,
            item.seller_id,
            &item.filename,
            item.unit_price_cents,
            item.quantity,
            total_cents,
        ],
        |row| row.get::<_, i64>(0),
    )?;

    Ok(OrderItem {
        id,
        order_id,
        photo_id: item.photo_id,
        seller_id: item.seller_id,
        filename: item.filename.clone(),
        unit_price_cents: item.unit_price_cents,
        quantity: item.quantity,
        total_cents,
    })
}

pub fn list_order_items(conn: &Connection, order_id: i64) -> Result<Vec<OrderItem>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM order_items WHERE order_id = ?1 ORDER BY id",
            ORDER_ITEM_COLS
        ),
        &[&order_id],
    )
}

pub fn get_order_item(conn: &Connection, order_id: i64, photo_id: i64) -> Result<Option<OrderItem>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM order_items WHERE order_id = ?1 AND photo_id = ?2 ORDER BY id LIMIT 1",
            ORDER_ITEM_COLS
        ),
        &[&order_id, &photo_id],
    )
}

// ============ Transactions ============

/// Insert a transaction, or return the row already recorded for the same
/// gateway id. A gateway replaying an intent for a repeated idempotency key
/// hands the same id to concurrent callers; the first insert wins.
pub fn create_transaction(conn: &Connection, input: &CreateTransaction) -> Result<Transaction> {
    let now = now();
    let metadata = serde_json::to_string(&input.metadata)?;
    let inserted = conn
        .query_row(
            "INSERT INTO transactions (order_id, gateway, gateway_transaction_id, amount_cents,
                currency, status, metadata, processed_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(gateway, gateway_transaction_id) DO NOTHING
             RETURNING id",
            params![
                input.order_id,
                &input.gateway,
                &input.gateway_transaction_id,
                input.amount_cents,
                &input.currency,
                input.status.as_ref(),
                metadata,
                input.processed_at,
                now,
            ],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;

    let Some(id) = inserted else {
        tracing::debug!(
            gateway = %input.gateway,
            gateway_transaction_id = %input.gateway_transaction_id,
            "Transaction already recorded, using existing row"
        );
        return get_transaction_by_gateway_id(conn, &input.gateway, &input.gateway_transaction_id)?
            .ok_or_else(|| AppError::Internal("Transaction vanished after conflict".into()));
    };

    Ok(Transaction {
        id,
        order_id: input.order_id,
        gateway: input.gateway.clone(),
        gateway_transaction_id: input.gateway_transaction_id.clone(),
        amount_cents: input.amount_cents,
        refunded_cents: 0,
        currency: input.currency.clone(),
        status: input.status,
        metadata: input.metadata.clone(),
        processed_at: input.processed_at,
        created_at: now,
        updated_at: now,
    })
}

pub fn get_transaction_by_id(conn: &Connection, id: i64) -> Result<Option<Transaction>> {
    query_one(
        conn,
        &format!("SELECT {} FROM transactions WHERE id = ?1", TRANSACTION_COLS),
        &[&id],
    )
}

pub fn get_transaction_by_gateway_id(
    conn: &Connection,
    gateway: &str,
    gateway_transaction_id: &str,
) -> Result<Option<Transaction>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM transactions WHERE gateway = ?1 AND gateway_transaction_id = ?2",
            TRANSACTION_COLS
        ),
        &[&gateway, &gateway_transaction_id],
    )
}

pub fn list_transactions_by_charge_id(conn: &Connection, charge_id: &str) -> Result<Vec<Transaction>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM transactions WHERE json_extract(metadata, '$.charge_id') = ?1 ORDER BY id",
            TRANSACTION_COLS
        ),
        &[&charge_id],
    )
}

pub fn list_transactions_for_order(conn: &Connection, order_id: i64) -> Result<Vec<Transaction>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM transactions WHERE order_id = ?1 ORDER BY id",
            TRANSACTION_COLS
        ),
        &[&order_id],
    )
}

/// Most recent transaction still waiting on the gateway (reused when reopening checkout).
pub fn get_open_transaction_for_order(conn: &Connection, order_id: i64) -> Result<Option<Transaction>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM transactions
             WHERE order_id = ?1 AND status IN ('pending', 'processing')
             ORDER BY id DESC LIMIT 1",
            TRANSACTION_COLS
        ),
        &[&order_id],
    )
}

/// Most recent transaction that still has money to refund.
pub fn get_latest_refundable_transaction(
    conn: &Connection,
    order_id: i64,
) -> Result<Option<Transaction>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM transactions
             WHERE order_id = ?1 AND status IN ('completed', 'partially_refunded')
             ORDER BY id DESC LIMIT 1",
            TRANSACTION_COLS
        ),
        &[&order_id],
    )
}

/// Mark a transaction completed with merged charge metadata.
pub fn complete_transaction(
    conn: &Connection,
    id: i64,
    amount_cents: i64,
    metadata: &serde_json::Value,
    processed_at: i64,
) -> Result<Option<Transaction>> {
    UpdateBuilder::new("transactions", id)
        .with_updated_at()
        .set("status", TransactionStatus::Completed.as_ref().to_string())
        .set("amount_cents", amount_cents)
        .set("metadata", serde_json::to_string(metadata)?)
        .set("processed_at", processed_at)
        .execute_returning(conn, TRANSACTION_COLS)
}

/// Update status and metadata of a transaction that has not settled.
pub fn update_open_transaction(
    conn: &Connection,
    id: i64,
    expected: TransactionStatus,
    status: TransactionStatus,
    metadata: Option<&serde_json::Value>,
) -> Result<Option<Transaction>> {
    let metadata = metadata.map(serde_json::to_string).transpose()?;
    UpdateBuilder::new("transactions", id)
        .with_updated_at()
        .set("status", status.as_ref().to_string())
        .set_opt("metadata", metadata)
        .guard("status", expected.as_ref().to_string())
        .execute_returning(conn, TRANSACTION_COLS)
}

/// Atomically add a refunded amount. The status follows the new cumulative total.
///
/// Returns None when the transaction is not refundable or the amount would exceed
/// what remains, so two concurrent refunds can never over-refund.
pub fn apply_refund_to_transaction(
    conn: &Connection,
    id: i64,
    amount_cents: i64,
    metadata: &serde_json::Value,
) -> Result<Option<Transaction>> {
    let metadata = serde_json::to_string(metadata)?;
    conn.query_row(
        &format!(
            "UPDATE transactions SET
                refunded_cents = refunded_cents + ?1,
                status = CASE WHEN refunded_cents + ?1 >= amount_cents
                    THEN 'refunded' ELSE 'partially_refunded' END,
                metadata = ?2,
                updated_at = ?3
             WHERE id = ?4
               AND status IN ('completed', 'partially_refunded')
               AND ?1 > 0
               AND refunded_cents + ?1 <= amount_cents
             RETURNING {}",
            TRANSACTION_COLS
        ),
        params![amount_cents, metadata, now(), id],
        Transaction::from_row,
    )
    .optional()
    .map_err(Into::into)
}

pub fn sum_refunded_for_order(conn: &Connection, order_id: i64) -> Result<i64> {
    let total = conn.query_row(
        "SELECT COALESCE(SUM(refunded_cents), 0) FROM transactions WHERE order_id = ?1",
        params![order_id],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(total)
}

// ============ Downloads ============

/// Insert a grant unless one already exists for (order, photo, user).
///
/// Returns the new id, or None if a concurrent writer created the row first.
/// The loser should re-read the winner with `get_download_for`.
pub fn insert_download_if_absent(conn: &Connection, input: &NewDownload) -> Result<Option<i64>> {
    let now = now();
    conn.query_row(
        "INSERT INTO downloads (order_id, photo_id, user_id, secret_hash, expires_at,
            max_attempts, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT(order_id, photo_id, user_id) DO NOTHING
         RETURNING id",
        params![
            input.order_id,
            input.photo_id,
            input.user_id,
            &input.secret_hash,
            input.expires_at,
            input.max_attempts,
            now,
        ],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_download_by_id(conn: &Connection, id: i64) -> Result<Option<Download>> {
    query_one(
        conn,
        &format!("SELECT {} FROM downloads WHERE id = ?1", DOWNLOAD_COLS),
        &[&id],
    )
}

pub fn get_download_for(
    conn: &Connection,
    order_id: i64,
    photo_id: i64,
    user_id: i64,
) -> Result<Option<Download>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM downloads WHERE order_id = ?1 AND photo_id = ?2 AND user_id = ?3",
            DOWNLOAD_COLS
        ),
        &[&order_id, &photo_id, &user_id],
    )
}

pub fn list_downloads_for_order_user(
    conn: &Connection,
    order_id: i64,
    user_id: i64,
) -> Result<Vec<Download>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM downloads WHERE order_id = ?1 AND user_id = ?2 ORDER BY id",
            DOWNLOAD_COLS
        ),
        &[&order_id, &user_id],
    )
}

pub fn count_downloads_for_order(conn: &Connection, order_id: i64) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM downloads WHERE order_id = ?1",
        params![order_id],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(count)
}

/// Downloads selected for token regeneration.
pub fn list_downloads_for_regeneration(
    conn: &Connection,
    expired_before: Option<i64>,
    order_id: Option<i64>,
) -> Result<Vec<Download>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM downloads
             WHERE (?1 IS NULL OR expires_at < ?1)
               AND (?2 IS NULL OR order_id = ?2)
             ORDER BY id",
            DOWNLOAD_COLS
        ),
        &[&expired_before, &order_id],
    )
}

pub fn set_download_url(conn: &Connection, id: i64, url: &str) -> Result<Option<Download>> {
    UpdateBuilder::new("downloads", id)
        .with_updated_at()
        .set("download_url", url.to_string())
        .execute_returning(conn, DOWNLOAD_COLS)
}

pub fn extend_download_expiry(conn: &Connection, id: i64, expires_at: i64) -> Result<Option<Download>> {
    UpdateBuilder::new("downloads", id)
        .with_updated_at()
        .set("expires_at", expires_at)
        .execute_returning(conn, DOWNLOAD_COLS)
}

/// Rotate a grant: new secret, new URL, new expiry, attempts reset.
pub fn regenerate_download(
    conn: &Connection,
    id: i64,
    secret_hash: &str,
    url: &str,
    expires_at: i64,
) -> Result<Option<Download>> {
    UpdateBuilder::new("downloads", id)
        .with_updated_at()
        .set("secret_hash", secret_hash.to_string())
        .set("download_url", url.to_string())
        .set("expires_at", expires_at)
        .set("attempts", 0i64)
        .execute_returning(conn, DOWNLOAD_COLS)
}

/// Atomically consume one download attempt.
///
/// Single conditional UPDATE so concurrent requests can never push `attempts`
/// past `max_attempts`. Returns the new count, or None if nothing was left.
pub fn increment_download_attempts(conn: &Connection, id: i64) -> Result<Option<i64>> {
    conn.query_row(
        "UPDATE downloads SET attempts = attempts + 1, updated_at = ?1
         WHERE id = ?2 AND attempts < max_attempts
         RETURNING attempts",
        params![now(), id],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map_err(Into::into)
}

pub fn record_download_metadata(
    conn: &Connection,
    id: i64,
    ip_address: Option<&str>,
    user_agent: Option<&str>,
    downloaded_at: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE downloads SET downloaded_at = ?1, ip_address = ?2, user_agent = ?3 WHERE id = ?4",
        params![downloaded_at, ip_address, user_agent, id],
    )?;
    Ok(())
}
