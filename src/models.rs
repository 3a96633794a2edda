use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{NoneAsEmptyString, serde_as};
use uuid::Uuid;

/// Fulfillment state attached to an order. `Processing` is the implicit
/// default when no delivery row exists yet or the stored value is not
/// recognized; serde requires the catch-all variant to sit last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Placed,
    Shipped,
    Delivered,
    Cancelled,
    #[default]
    #[serde(other)]
    Processing,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Processing => "processing",
            DeliveryStatus::Placed => "placed",
            DeliveryStatus::Shipped => "shipped",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Cancelled => "cancelled",
        }
    }
}

/// Marketplace channel a listing was posted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Rent,
    #[default]
    #[serde(other)]
    P2p,
}

/// Where an order item came from. Marketplace items have a listing row and
/// produce seller earnings; catalog items are platform-owned and the ledger
/// skips them without a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemOrigin {
    Catalog,
    #[default]
    #[serde(other)]
    Marketplace,
}

/// Listing lifecycle. `ActiveSold`/`ActiveRented` keep the item visible in
/// history views after a sale; the fully hidden `Sold`/`Rented` states are
/// reserved for explicit seller action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ListingStatus {
    #[serde(rename = "active-sold")]
    ActiveSold,
    #[serde(rename = "active-rented")]
    ActiveRented,
    #[serde(rename = "sold")]
    Sold,
    #[serde(rename = "rented")]
    Rented,
    #[default]
    #[serde(rename = "active")]
    #[serde(other)]
    Active,
}

impl ListingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ListingStatus::Active => "active",
            ListingStatus::ActiveSold => "active-sold",
            ListingStatus::ActiveRented => "active-rented",
            ListingStatus::Sold => "sold",
            ListingStatus::Rented => "rented",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Paid,
    #[default]
    #[serde(other)]
    Pending,
}

/// One buyer checkout event. Immutable after creation; fulfillment status
/// lives on the delivery row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub shipping_address: String,
    pub total_amount: f64,
    pub placed_at: DateTime<Utc>,
    #[serde(default)]
    pub order_status: Option<String>,
}

/// One purchased unit within an order. Created atomically with the order and
/// never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub order_item_id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: u32,
    pub price: f64,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub origin: ItemOrigin,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub delivery_id: Uuid,
    pub order_id: Uuid,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub tracking_number: Option<String>,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub carrier_name: Option<String>,
    #[serde(default)]
    pub delivery_status: DeliveryStatus,
    #[serde(default)]
    pub estimated_delivery_date: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Payment snapshot for an order. Read-only here; capture happens in an
/// external gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub payment_method: String,
    pub amount: f64,
    pub currency: String,
    pub status: String,
}

/// A seller-posted sellable or rentable listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FashionItem {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price: f64,
    #[serde(default)]
    pub sizes: Vec<String>,
    #[serde(default)]
    pub colors: Vec<String>,
    #[serde(default)]
    pub channel: Channel,
    #[serde(default)]
    pub status: ListingStatus,
    #[serde(default)]
    pub quantity_sold: u32,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub deleted_status: bool,
}

/// One recognized marketplace sale for one seller. Name and image URL are
/// snapshotted at insert time so later listing edits never rewrite history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SellerEarning {
    pub id: Uuid,
    pub user_id: Uuid,
    pub item_id: Uuid,
    pub order_item_id: Uuid,
    pub item_name: String,
    pub sale_amount: f64,
    pub commission_rate: f64,
    pub net_amount: f64,
    #[serde(default)]
    pub payment_status: PaymentStatus,
    pub sale_date: DateTime<Utc>,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Named-field join of everything a buyer-facing order screen needs.
#[derive(Debug, Clone, Serialize)]
pub struct OrderDetail {
    pub order: Order,
    pub delivery: Option<Delivery>,
    pub payment: Option<Payment>,
    pub items: Vec<OrderItem>,
}

impl OrderDetail {
    pub fn delivery_status(&self) -> DeliveryStatus {
        self.delivery
            .as_ref()
            .map(|d| d.delivery_status)
            .unwrap_or_default()
    }
}

/// Aggregation over a seller's earnings rows. Pure read; safe at any
/// frequency.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SellerStats {
    pub total_net: f64,
    pub sale_count: usize,
    pub pending_net: f64,
    pub paid_net: f64,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_delivery_status_defaults_to_processing() {
        let status: DeliveryStatus = serde_json::from_str("\"en_route\"").unwrap();
        assert_eq!(status, DeliveryStatus::Processing);
        let status: DeliveryStatus = serde_json::from_str("\"shipped\"").unwrap();
        assert_eq!(status, DeliveryStatus::Shipped);
    }

    #[test]
    fn every_status_enum_catches_unknown_strings() {
        let channel: Channel = serde_json::from_str("\"wholesale\"").unwrap();
        assert_eq!(channel, Channel::P2p);
        let origin: ItemOrigin = serde_json::from_str("\"dropship\"").unwrap();
        assert_eq!(origin, ItemOrigin::Marketplace);
        let listing: ListingStatus = serde_json::from_str("\"archived\"").unwrap();
        assert_eq!(listing, ListingStatus::Active);
        let payment: PaymentStatus = serde_json::from_str("\"refunded\"").unwrap();
        assert_eq!(payment, PaymentStatus::Pending);
        // Known values still parse to their own variants.
        let channel: Channel = serde_json::from_str("\"rent\"").unwrap();
        assert_eq!(channel, Channel::Rent);
        let payment: PaymentStatus = serde_json::from_str("\"paid\"").unwrap();
        assert_eq!(payment, PaymentStatus::Paid);
    }

    #[test]
    fn listing_status_round_trips_hyphenated_names() {
        let json = serde_json::to_string(&ListingStatus::ActiveSold).unwrap();
        assert_eq!(json, "\"active-sold\"");
        let back: ListingStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ListingStatus::ActiveSold);
    }

    #[test]
    fn empty_tracking_number_reads_as_none() {
        let raw = serde_json::json!({
            "delivery_id": Uuid::new_v4(),
            "order_id": Uuid::new_v4(),
            "tracking_number": "",
            "carrier_name": "DHL",
            "delivery_status": "placed",
            "updated_at": Utc::now(),
        });
        let delivery: Delivery = serde_json::from_value(raw).unwrap();
        assert!(delivery.tracking_number.is_none());
        assert_eq!(delivery.carrier_name.as_deref(), Some("DHL"));
    }
}
