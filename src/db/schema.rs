use rusqlite::Connection;

/// Initialize the database schema
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        -- Orders. Totals are computed once (checkout or pre-order finalization)
        -- and satisfy total_cents = subtotal_cents - discount_cents + tax_cents.
        CREATE TABLE IF NOT EXISTS orders (
            id INTEGER PRIMARY KEY,
            order_number TEXT NOT NULL UNIQUE,
            buyer_id INTEGER NOT NULL,
            seller_id INTEGER NOT NULL,
            order_type TEXT NOT NULL CHECK (order_type IN ('direct', 'pre_order')),
            status TEXT NOT NULL CHECK (status IN (
                'pending', 'processing', 'completed', 'cancelled', 'refunded',
                'pre_order_pending', 'pre_order_paid', 'pre_order_selecting', 'pre_order_finalized'
            )),
            subtotal_cents INTEGER NOT NULL,
            discount_cents INTEGER NOT NULL DEFAULT 0,
            tax_cents INTEGER NOT NULL DEFAULT 0,
            total_cents INTEGER NOT NULL,
            currency TEXT NOT NULL,
            package_id INTEGER,
            package_photo_count INTEGER,
            gallery_id INTEGER,
            buyer_email TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            CHECK (total_cents = subtotal_cents - discount_cents + tax_cents)
        );
        CREATE INDEX IF NOT EXISTS idx_orders_buyer ON orders(buyer_id);
        CREATE INDEX IF NOT EXISTS idx_orders_seller ON orders(seller_id);

        CREATE TABLE IF NOT EXISTS order_items (
            id INTEGER PRIMARY KEY,
            order_id INTEGER NOT NULL REFERENCES orders(id),
            photo_id INTEGER NOT NULL,
            seller_id INTEGER NOT NULL,
            filename TEXT NOT NULL,
            unit_price_cents INTEGER NOT NULL,
            quantity INTEGER NOT NULL DEFAULT 1,
            total_cents INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id);

        -- Payment attempts. One row per gateway intent.
        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY,
            order_id INTEGER NOT NULL REFERENCES orders(id),
            gateway TEXT NOT NULL,
            gateway_transaction_id TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            refunded_cents INTEGER NOT NULL DEFAULT 0,
            currency TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN (
                'pending', 'processing', 'completed', 'failed', 'cancelled',
                'refunded', 'partially_refunded'
            )),
            metadata TEXT NOT NULL DEFAULT '{}',
            processed_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(gateway, gateway_transaction_id),
            CHECK (refunded_cents >= 0 AND refunded_cents <= amount_cents)
        );
        CREATE INDEX IF NOT EXISTS idx_transactions_order ON transactions(order_id);
        CREATE INDEX IF NOT EXISTS idx_transactions_charge
            ON transactions(json_extract(metadata, '$.charge_id'));

        -- Download grants. The secret is stored hashed; attempts only ever grow
        -- except on regeneration.
        CREATE TABLE IF NOT EXISTS downloads (
            id INTEGER PRIMARY KEY,
            order_id INTEGER NOT NULL REFERENCES orders(id),
            photo_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            secret_hash TEXT NOT NULL,
            download_url TEXT NOT NULL DEFAULT '',
            expires_at INTEGER NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            downloaded_at INTEGER,
            ip_address TEXT,
            user_agent TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(order_id, photo_id, user_id)
        );
        CREATE INDEX IF NOT EXISTS idx_downloads_order_user ON downloads(order_id, user_id);
        CREATE INDEX IF NOT EXISTS idx_downloads_expires ON downloads(expires_at);
        "#,
    )
}
