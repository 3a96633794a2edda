use crate::models::{
    Delivery, DeliveryStatus, FashionItem, ListingStatus, Order, OrderItem, Payment, PaymentStatus,
    SellerEarning,
};
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("row already exists")]
    Conflict,
    #[error("row not found")]
    NotFound,
}

/// Relational seam every domain component is written against. The production
/// implementation lives in `supabase.rs`; tests swap in `testing::MemStore`.
pub trait MarketplaceStore {
    fn order_by_id(&self, order_id: Uuid) -> impl Future<Output = Result<Order, StoreError>> + Send;

    fn orders_for_user(
        &self,
        user_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Order>, StoreError>> + Send;

    fn items_for_order(
        &self,
        order_id: Uuid,
    ) -> impl Future<Output = Result<Vec<OrderItem>, StoreError>> + Send;

    fn delivery_for_order(
        &self,
        order_id: Uuid,
    ) -> impl Future<Output = Result<Option<Delivery>, StoreError>> + Send;

    fn payment_for_order(
        &self,
        order_id: Uuid,
    ) -> impl Future<Output = Result<Option<Payment>, StoreError>> + Send;

    /// Creates the delivery row when none exists yet, otherwise updates it in
    /// place. Exactly one write either way.
    fn upsert_delivery_status(
        &self,
        order_id: Uuid,
        status: DeliveryStatus,
        estimated: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn listing_by_id(
        &self,
        listing_id: Uuid,
    ) -> impl Future<Output = Result<Option<FashionItem>, StoreError>> + Send;

    fn insert_listing(
        &self,
        listing: &FashionItem,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn soft_delete_listing(
        &self,
        listing_id: Uuid,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Conditional flip: sets the listing's status and sold counter only when
    /// its status is still `active`. Returns whether a row matched, so a
    /// concurrent caller that lost the race observes `false` instead of
    /// double-advancing the listing.
    fn mark_listing_sold(
        &self,
        listing_id: Uuid,
        status: ListingStatus,
        quantity_sold: u32,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn set_listing_status(
        &self,
        listing_id: Uuid,
        status: ListingStatus,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Insert guarded by the unique constraint on `order_item_id`; a duplicate
    /// surfaces as `StoreError::Conflict`.
    fn insert_earning(
        &self,
        earning: &SellerEarning,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn earning_by_order_item(
        &self,
        order_item_id: Uuid,
    ) -> impl Future<Output = Result<Option<SellerEarning>, StoreError>> + Send;

    fn earnings_for_seller(
        &self,
        seller_id: Uuid,
    ) -> impl Future<Output = Result<Vec<SellerEarning>, StoreError>> + Send;

    /// One-directional `pending → paid`. Returns whether a pending row
    /// matched.
    fn mark_earning_paid(
        &self,
        earning_id: Uuid,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

/// One stored object as reported by the bucket listing.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub key: String,
    pub created_at: DateTime<Utc>,
}

/// Object-storage seam used by the upload pipeline and the retention sweeper.
pub trait ObjectStore {
    fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Multipart/form-data flavored upload of the same payload.
    fn put_object_multipart(
        &self,
        key: &str,
        file_name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn public_url(&self, key: &str) -> String;

    /// Confirms the public URL serves a 2xx with non-zero content length and
    /// returns that length.
    fn verify_public(&self, url: &str) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Lists up to `limit` objects sorted ascending by creation time.
    fn list_oldest(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<StoredObject>, StoreError>> + Send;

    fn delete_objects(
        &self,
        keys: &[String],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub struct MemState {
        pub orders: Vec<Order>,
        pub items: Vec<OrderItem>,
        pub deliveries: Vec<Delivery>,
        pub payments: Vec<Payment>,
        pub listings: Vec<FashionItem>,
        pub earnings: Vec<SellerEarning>,
    }

    /// In-memory stand-in for the Supabase tables.
    #[derive(Clone, Default)]
    pub struct MemStore {
        pub state: Arc<Mutex<MemState>>,
        /// When positive, the next N earning inserts fail with a request
        /// error. Used to exercise per-item partial failure.
        pub failing_earning_inserts: Arc<AtomicUsize>,
    }

    impl MemStore {
        pub fn with<T>(&self, f: impl FnOnce(&mut MemState) -> T) -> T {
            let mut guard = self.state.lock().unwrap();
            f(&mut guard)
        }
    }

    impl MarketplaceStore for MemStore {
        async fn order_by_id(&self, order_id: Uuid) -> Result<Order, StoreError> {
            self.with(|s| {
                s.orders
                    .iter()
                    .find(|o| o.order_id == order_id)
                    .cloned()
                    .ok_or(StoreError::NotFound)
            })
        }

        async fn orders_for_user(&self, user_id: Uuid) -> Result<Vec<Order>, StoreError> {
            Ok(self.with(|s| {
                s.orders
                    .iter()
                    .filter(|o| o.user_id == user_id)
                    .cloned()
                    .collect()
            }))
        }

        async fn items_for_order(&self, order_id: Uuid) -> Result<Vec<OrderItem>, StoreError> {
            Ok(self.with(|s| {
                s.items
                    .iter()
                    .filter(|i| i.order_id == order_id)
                    .cloned()
                    .collect()
            }))
        }

        async fn delivery_for_order(&self, order_id: Uuid) -> Result<Option<Delivery>, StoreError> {
            Ok(self.with(|s| {
                s.deliveries
                    .iter()
                    .find(|d| d.order_id == order_id)
                    .cloned()
            }))
        }

        async fn payment_for_order(&self, order_id: Uuid) -> Result<Option<Payment>, StoreError> {
            Ok(self.with(|s| s.payments.iter().find(|p| p.order_id == order_id).cloned()))
        }

        async fn upsert_delivery_status(
            &self,
            order_id: Uuid,
            status: DeliveryStatus,
            estimated: Option<DateTime<Utc>>,
        ) -> Result<(), StoreError> {
            self.with(|s| {
                if let Some(existing) = s.deliveries.iter_mut().find(|d| d.order_id == order_id) {
                    existing.delivery_status = status;
                    if estimated.is_some() {
                        existing.estimated_delivery_date = estimated;
                    }
                    existing.updated_at = Utc::now();
                } else {
                    s.deliveries.push(Delivery {
                        delivery_id: Uuid::new_v4(),
                        order_id,
                        tracking_number: None,
                        carrier_name: None,
                        delivery_status: status,
                        estimated_delivery_date: estimated,
                        updated_at: Utc::now(),
                    });
                }
            });
            Ok(())
        }

        async fn listing_by_id(&self, listing_id: Uuid) -> Result<Option<FashionItem>, StoreError> {
            Ok(self.with(|s| s.listings.iter().find(|l| l.id == listing_id).cloned()))
        }

        async fn insert_listing(&self, listing: &FashionItem) -> Result<(), StoreError> {
            self.with(|s| s.listings.push(listing.clone()));
            Ok(())
        }

        async fn soft_delete_listing(&self, listing_id: Uuid) -> Result<(), StoreError> {
            self.with(|s| {
                match s.listings.iter_mut().find(|l| l.id == listing_id) {
                    Some(listing) => {
                        listing.deleted_status = true;
                        Ok(())
                    }
                    None => Err(StoreError::NotFound),
                }
            })
        }

        async fn mark_listing_sold(
            &self,
            listing_id: Uuid,
            status: ListingStatus,
            quantity_sold: u32,
        ) -> Result<bool, StoreError> {
            Ok(self.with(|s| {
                match s
                    .listings
                    .iter_mut()
                    .find(|l| l.id == listing_id && l.status == ListingStatus::Active)
                {
                    Some(listing) => {
                        listing.status = status;
                        listing.quantity_sold = quantity_sold;
                        true
                    }
                    None => false,
                }
            }))
        }

        async fn set_listing_status(
            &self,
            listing_id: Uuid,
            status: ListingStatus,
        ) -> Result<(), StoreError> {
            self.with(|s| {
                match s.listings.iter_mut().find(|l| l.id == listing_id) {
                    Some(listing) => {
                        listing.status = status;
                        Ok(())
                    }
                    None => Err(StoreError::NotFound),
                }
            })
        }

        async fn insert_earning(&self, earning: &SellerEarning) -> Result<(), StoreError> {
            let failures = &self.failing_earning_inserts;
            if failures.load(Ordering::SeqCst) > 0 {
                failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Request("injected insert failure".into()));
            }
            self.with(|s| {
                if s.earnings
                    .iter()
                    .any(|e| e.order_item_id == earning.order_item_id)
                {
                    Err(StoreError::Conflict)
                } else {
                    s.earnings.push(earning.clone());
                    Ok(())
                }
            })
        }

        async fn earning_by_order_item(
            &self,
            order_item_id: Uuid,
        ) -> Result<Option<SellerEarning>, StoreError> {
            Ok(self.with(|s| {
                s.earnings
                    .iter()
                    .find(|e| e.order_item_id == order_item_id)
                    .cloned()
            }))
        }

        async fn earnings_for_seller(
            &self,
            seller_id: Uuid,
        ) -> Result<Vec<SellerEarning>, StoreError> {
            Ok(self.with(|s| {
                s.earnings
                    .iter()
                    .filter(|e| e.user_id == seller_id)
                    .cloned()
                    .collect()
            }))
        }

        async fn mark_earning_paid(&self, earning_id: Uuid) -> Result<bool, StoreError> {
            Ok(self.with(|s| {
                match s
                    .earnings
                    .iter_mut()
                    .find(|e| e.id == earning_id && e.payment_status == PaymentStatus::Pending)
                {
                    Some(earning) => {
                        earning.payment_status = PaymentStatus::Paid;
                        true
                    }
                    None => false,
                }
            }))
        }
    }

    /// In-memory bucket with injectable upload failures. The first
    /// `failing_puts` calls to `put_object` error, which drives the
    /// strategy-fallback tests.
    #[derive(Clone, Default)]
    pub struct MemBucket {
        pub objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
        pub created_order: Arc<Mutex<Vec<(String, DateTime<Utc>)>>>,
        pub failing_puts: Arc<AtomicUsize>,
        pub failing_deletes: Arc<AtomicUsize>,
    }

    impl MemBucket {
        pub fn insert_aged(&self, key: &str, created_at: DateTime<Utc>) {
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), vec![0u8; 4]);
            self.created_order
                .lock()
                .unwrap()
                .push((key.to_string(), created_at));
        }

        pub fn len(&self) -> usize {
            self.objects.lock().unwrap().len()
        }

        fn store(&self, key: &str, bytes: Vec<u8>) {
            self.objects.lock().unwrap().insert(key.to_string(), bytes);
            self.created_order
                .lock()
                .unwrap()
                .push((key.to_string(), Utc::now()));
        }
    }

    impl ObjectStore for MemBucket {
        async fn put_object(
            &self,
            key: &str,
            bytes: Vec<u8>,
            _content_type: &str,
        ) -> Result<(), StoreError> {
            let failures = &self.failing_puts;
            if failures.load(Ordering::SeqCst) > 0 {
                failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Request("injected upload failure".into()));
            }
            self.store(key, bytes);
            Ok(())
        }

        async fn put_object_multipart(
            &self,
            key: &str,
            _file_name: &str,
            bytes: Vec<u8>,
            content_type: &str,
        ) -> Result<(), StoreError> {
            self.put_object(key, bytes, content_type).await
        }

        fn public_url(&self, key: &str) -> String {
            format!("mem://bucket/{key}")
        }

        async fn verify_public(&self, url: &str) -> Result<u64, StoreError> {
            let key = url.trim_start_matches("mem://bucket/");
            let guard = self.objects.lock().unwrap();
            match guard.get(key) {
                Some(bytes) if !bytes.is_empty() => Ok(bytes.len() as u64),
                Some(_) => Ok(0),
                None => Err(StoreError::NotFound),
            }
        }

        async fn list_oldest(&self, limit: usize) -> Result<Vec<StoredObject>, StoreError> {
            let objects = self.objects.lock().unwrap();
            let mut listed: Vec<StoredObject> = self
                .created_order
                .lock()
                .unwrap()
                .iter()
                .filter(|(key, _)| objects.contains_key(key))
                .map(|(key, created_at)| StoredObject {
                    key: key.clone(),
                    created_at: *created_at,
                })
                .collect();
            listed.sort_by_key(|o| o.created_at);
            listed.truncate(limit);
            Ok(listed)
        }

        async fn delete_objects(&self, keys: &[String]) -> Result<(), StoreError> {
            let failures = &self.failing_deletes;
            if failures.load(Ordering::SeqCst) > 0 {
                failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Request("injected delete failure".into()));
            }
            let mut guard = self.objects.lock().unwrap();
            for key in keys {
                guard.remove(key);
            }
            Ok(())
        }
    }
}
