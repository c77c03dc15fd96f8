use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderType {
    Direct,
    PreOrder,
}

/// Order lifecycle status. Direct and pre-order orders use disjoint graphs,
/// except for the shared terminal states `cancelled` and `refunded`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Processing,
    Completed,
    Cancelled,
    Refunded,
    PreOrderPending,
    PreOrderPaid,
    PreOrderSelecting,
    PreOrderFinalized,
}

impl OrderStatus {
    /// Whether the buyer is entitled to download purchased files. A settled
    /// direct order sits in `processing` until fulfilment completes it.
    pub fn grants_access(&self) -> bool {
        matches!(
            self,
            Self::Processing | Self::Completed | Self::PreOrderFinalized
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Refunded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub order_number: String,
    pub buyer_id: i64,
    pub seller_id: i64,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub tax_cents: i64,
    /// Always `subtotal - discount + tax`, fixed at creation or pre-order finalization
    pub total_cents: i64,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_id: Option<i64>,
    /// Photos included in the pre-order package price
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_photo_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gallery_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buyer_email: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub photo_id: i64,
    pub seller_id: i64,
    pub filename: String,
    pub unit_price_cents: i64,
    pub quantity: i64,
    pub total_cents: i64,
}

/// A cart line submitted at checkout.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderItem {
    pub photo_id: i64,
    pub seller_id: i64,
    pub filename: String,
    pub unit_price_cents: i64,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
}

fn default_quantity() -> i64 {
    1
}

/// Data required to create a direct order.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrder {
    pub buyer_id: i64,
    #[serde(default)]
    pub buyer_email: Option<String>,
    pub items: Vec<CreateOrderItem>,
    #[serde(default)]
    pub discount_cents: i64,
    #[serde(default)]
    pub currency: Option<String>,
}

/// Data required to create a pre-order for a photographer's package.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePreOrder {
    pub buyer_id: i64,
    #[serde(default)]
    pub buyer_email: Option<String>,
    pub seller_id: i64,
    pub package_id: i64,
    pub package_price_cents: i64,
    pub package_photo_count: i64,
    #[serde(default)]
    pub currency: Option<String>,
}

/// Fully computed order row, ready for insertion.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_number: String,
    pub buyer_id: i64,
    pub seller_id: i64,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub totals: OrderTotals,
    pub currency: String,
    pub package_id: Option<i64>,
    pub package_photo_count: Option<i64>,
    pub buyer_email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrderTotals {
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
}

impl OrderTotals {
    /// Compute totals from a subtotal. The discount is clamped to `[0, subtotal]`
    /// and tax is applied to the discounted amount, rounded half-up to the cent.
    pub fn compute(subtotal_cents: i64, discount_cents: i64, tax_rate_bps: i64) -> Self {
        let discount_cents = discount_cents.clamp(0, subtotal_cents.max(0));
        let taxable = subtotal_cents - discount_cents;
        let tax_cents = (taxable * tax_rate_bps + 5_000) / 10_000;
        Self {
            subtotal_cents,
            discount_cents,
            tax_cents,
            total_cents: taxable + tax_cents,
        }
    }
}
