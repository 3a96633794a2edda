use crate::models::{
    Channel, FashionItem, ItemOrigin, ListingStatus, OrderItem, PaymentStatus, SellerEarning,
    SellerStats,
};
use crate::store::{MarketplaceStore, StoreError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Flat marketplace commission, in percent. No per-category or per-seller
/// overrides exist yet.
pub const COMMISSION_RATE_PERCENT: f64 = 5.0;

/// `(commission, net)` split of a sale amount. Pure arithmetic, never fails.
pub fn commission_split(sale_amount: f64) -> (f64, f64) {
    let commission = sale_amount * COMMISSION_RATE_PERCENT / 100.0;
    (commission, sale_amount - commission)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    CatalogItem,
    ListingMissing,
    ListingNotActive,
    AlreadyRecognized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizedEarning {
    pub earning_id: Uuid,
    pub order_item_id: Uuid,
    pub seller_id: Uuid,
    pub sale_amount: f64,
    pub net_amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedItem {
    pub order_item_id: Uuid,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemFailure {
    pub order_item_id: Uuid,
    pub error: String,
}

/// Per-order outcome of `recognize_earnings`. Partial success across a
/// multi-item order is expected; failures never abort the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarningsReport {
    pub order_id: Uuid,
    pub recognized: Vec<RecognizedEarning>,
    pub skipped: Vec<SkippedItem>,
    pub failures: Vec<ItemFailure>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ShipmentOutcome {
    Applied,
    /// The earning was already paid out (or does not exist); the transition
    /// is one-directional so nothing was written.
    NotPending,
}

enum ItemOutcome {
    Recognized(RecognizedEarning),
    Skipped(SkipReason),
}

/// Converts completed orders into seller-visible earnings and keeps the
/// originating listings in lockstep. Assumes the checkout collaborator only
/// calls in after payment capture succeeded.
pub struct SellerEarningsLedger<S> {
    store: S,
}

impl<S: MarketplaceStore> SellerEarningsLedger<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Processes every item under the order sequentially. Each item is
    /// guarded twice: the unique earning per order item (idempotency against
    /// retried webhooks) and the conditional `active`-only listing flip
    /// (against a racing recognizer or listing edit).
    pub async fn recognize_earnings(&self, order_id: Uuid) -> Result<EarningsReport, StoreError> {
        let items = self.store.items_for_order(order_id).await?;
        let mut report = EarningsReport {
            order_id,
            recognized: Vec::new(),
            skipped: Vec::new(),
            failures: Vec::new(),
        };

        for item in &items {
            match self.recognize_item(item).await {
                Ok(ItemOutcome::Recognized(earning)) => report.recognized.push(earning),
                Ok(ItemOutcome::Skipped(reason)) => report.skipped.push(SkippedItem {
                    order_item_id: item.order_item_id,
                    reason,
                }),
                Err(err) => {
                    warn!(
                        target = "relove.earnings",
                        order_id = %order_id,
                        order_item_id = %item.order_item_id,
                        error = %err,
                        "earning recognition failed for item, continuing batch"
                    );
                    report.failures.push(ItemFailure {
                        order_item_id: item.order_item_id,
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(
            target = "relove.earnings",
            order_id = %order_id,
            recognized = report.recognized.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            "earnings recognition finished"
        );
        Ok(report)
    }

    async fn recognize_item(&self, item: &OrderItem) -> Result<ItemOutcome, StoreError> {
        if item.origin == ItemOrigin::Catalog {
            return Ok(ItemOutcome::Skipped(SkipReason::CatalogItem));
        }

        let Some(listing) = self.store.listing_by_id(item.product_id).await? else {
            // Origin says marketplace but the row is gone; nothing to credit.
            warn!(
                target = "relove.earnings",
                order_item_id = %item.order_item_id,
                product_id = %item.product_id,
                "marketplace item has no listing row, skipping"
            );
            return Ok(ItemOutcome::Skipped(SkipReason::ListingMissing));
        };
        if listing.deleted_status || listing.status != ListingStatus::Active {
            return Ok(ItemOutcome::Skipped(SkipReason::ListingNotActive));
        }
        if self
            .store
            .earning_by_order_item(item.order_item_id)
            .await?
            .is_some()
        {
            return Ok(ItemOutcome::Skipped(SkipReason::AlreadyRecognized));
        }

        let earning = build_earning(item, &listing);
        match self.store.insert_earning(&earning).await {
            Ok(()) => {}
            // Unique constraint on order_item_id: a concurrent recognizer won.
            Err(StoreError::Conflict) => {
                return Ok(ItemOutcome::Skipped(SkipReason::AlreadyRecognized));
            }
            Err(err) => return Err(err),
        }

        let sold_status = match listing.channel {
            Channel::P2p => ListingStatus::ActiveSold,
            Channel::Rent => ListingStatus::ActiveRented,
        };
        let matched = self
            .store
            .mark_listing_sold(listing.id, sold_status, listing.quantity_sold + 1)
            .await?;
        if !matched {
            warn!(
                target = "relove.earnings",
                listing_id = %listing.id,
                "listing was no longer active during flip; earning kept"
            );
        }

        Ok(ItemOutcome::Recognized(RecognizedEarning {
            earning_id: earning.id,
            order_item_id: item.order_item_id,
            seller_id: earning.user_id,
            sale_amount: earning.sale_amount,
            net_amount: earning.net_amount,
        }))
    }

    /// Seller confirmed shipment: flips the earning `pending → paid` and
    /// keeps the listing on `active-sold` so it stays visible in history
    /// views.
    pub async fn mark_shipped(
        &self,
        earning_id: Uuid,
        listing_id: Uuid,
    ) -> Result<ShipmentOutcome, StoreError> {
        if !self.store.mark_earning_paid(earning_id).await? {
            return Ok(ShipmentOutcome::NotPending);
        }
        self.store
            .set_listing_status(listing_id, ListingStatus::ActiveSold)
            .await?;
        info!(
            target = "relove.earnings",
            earning_id = %earning_id,
            listing_id = %listing_id,
            "earning paid out on shipment"
        );
        Ok(ShipmentOutcome::Applied)
    }

    /// Pure aggregation over the seller's earnings rows.
    pub async fn seller_stats(&self, seller_id: Uuid) -> Result<SellerStats, StoreError> {
        let earnings = self.store.earnings_for_seller(seller_id).await?;
        let mut stats = SellerStats::default();
        for earning in &earnings {
            stats.total_net += earning.net_amount;
            stats.sale_count += 1;
            match earning.payment_status {
                PaymentStatus::Pending => stats.pending_net += earning.net_amount,
                PaymentStatus::Paid => stats.paid_net += earning.net_amount,
            }
        }
        Ok(stats)
    }
}

fn build_earning(item: &OrderItem, listing: &FashionItem) -> SellerEarning {
    let sale_amount = item.price * f64::from(item.quantity.max(1));
    let (_, net_amount) = commission_split(sale_amount);
    SellerEarning {
        id: Uuid::new_v4(),
        user_id: listing.user_id,
        item_id: listing.id,
        order_item_id: item.order_item_id,
        item_name: listing.name.clone(),
        sale_amount,
        commission_rate: COMMISSION_RATE_PERCENT,
        net_amount,
        payment_status: PaymentStatus::Pending,
        sale_date: Utc::now(),
        image_url: listing.image_urls.first().cloned(),
    }
}
