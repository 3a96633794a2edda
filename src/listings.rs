use crate::models::{Channel, FashionItem, ListingStatus};
use crate::store::{MarketplaceStore, StoreError};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

/// Input for a new marketplace listing; image URLs come from the upload
/// pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct NewListing {
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
}

/// Creates and soft-deletes `FashionItem` rows, and is the "exists and is
/// active" source of truth the earnings ledger reads.
pub struct ListingStore<S> {
    store: S,
}

impl<S: MarketplaceStore> ListingStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn create(
        &self,
        new: NewListing,
        image_urls: Vec<String>,
    ) -> Result<FashionItem, StoreError> {
        let listing = FashionItem {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            name: new.name,
            description: new.description,
            price: new.price,
            sizes: new.sizes,
            colors: new.colors,
            channel: new.channel,
            status: ListingStatus::Active,
            quantity_sold: 0,
            image_urls,
            deleted_status: false,
        };
        self.store.insert_listing(&listing).await?;
        info!(
            target = "relove.listings",
            listing_id = %listing.id,
            seller_id = %listing.user_id,
            images = listing.image_urls.len(),
            "listing created"
        );
        Ok(listing)
    }

    /// Sets the deleted marker without removing the row; earnings records
    /// reference listing images by URL, so the row and its URLs stay.
    pub async fn soft_delete(&self, listing_id: Uuid) -> Result<(), StoreError> {
        self.store.soft_delete_listing(listing_id).await?;
        info!(target = "relove.listings", listing_id = %listing_id, "listing soft-deleted");
        Ok(())
    }

    pub async fn get(&self, listing_id: Uuid) -> Result<Option<FashionItem>, StoreError> {
        self.store.listing_by_id(listing_id).await
    }

    pub async fn is_active(&self, listing_id: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .get(listing_id)
            .await?
            .map(|l| !l.deleted_status && l.status == ListingStatus::Active)
            .unwrap_or(false))
    }
}
