use crate::http::shared_client;
use crate::models::{
    Delivery, DeliveryStatus, FashionItem, ListingStatus, Order, OrderItem, Payment, SellerEarning,
};
use crate::store::{MarketplaceStore, ObjectStore, StoreError, StoredObject};
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use uuid::Uuid;

/// Thin client over Supabase's PostgREST and Storage APIs. All table and
/// bucket traffic in the subsystem funnels through here.
#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    bucket: String,
    http: Client,
}

impl SupabaseClient {
    pub fn new(base_url: &str, service_key: &str, bucket: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
            bucket: bucket.to_string(),
            http: shared_client(),
        }
    }

    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        let bucket =
            std::env::var("PRODUCT_IMAGE_BUCKET").unwrap_or_else(|_| "product-images".to_string());
        Some(Self::new(&base_url, &service_key, &bucket))
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    fn rest_url(&self, table: &str, query: &str) -> String {
        format!("{}/rest/v1/{table}?{query}", self.base_url)
    }

    async fn select_rows<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &str,
    ) -> Result<Vec<T>, StoreError> {
        let response = self
            .authed(self.http.get(self.rest_url(table, query)))
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }
        response
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))
    }

    async fn select_one<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &str,
    ) -> Result<Option<T>, StoreError> {
        let mut rows: Vec<T> = self.select_rows(table, &format!("{query}&limit=1")).await?;
        Ok(rows.pop())
    }

    async fn insert_row(&self, table: &str, row: Value) -> Result<(), StoreError> {
        let response = self
            .authed(self.http.post(self.rest_url(table, "")))
            .header("Prefer", "return=minimal")
            .json(&row)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if response.status() == StatusCode::CONFLICT {
            return Err(StoreError::Conflict);
        }
        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }
        Ok(())
    }

    /// PATCH with a row filter. Returns how many rows matched, which is what
    /// the conditional status flips key off.
    async fn patch_rows(&self, table: &str, query: &str, body: Value) -> Result<usize, StoreError> {
        let response = self
            .authed(self.http.patch(self.rest_url(table, query)))
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }
        let rows: Vec<Value> = response
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))?;
        Ok(rows.len())
    }

    fn storage_object_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url,
            self.bucket,
            encode_key(key)
        )
    }

    /// One folder level of the bucket listing. The Storage list endpoint is
    /// folder-scoped: it never recurses into sub-prefixes on its own.
    async fn list_folder(&self, prefix: &str, limit: usize) -> Result<Vec<BucketEntry>, StoreError> {
        let url = format!("{}/storage/v1/object/list/{}", self.base_url, self.bucket);
        let body = json!({
            "prefix": prefix,
            "limit": limit,
            "offset": 0,
            "sortBy": { "column": "created_at", "order": "asc" },
        });
        let response = self
            .authed(self.http.post(url))
            .json(&body)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }
        response
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))
    }
}

fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

impl MarketplaceStore for SupabaseClient {
    async fn order_by_id(&self, order_id: Uuid) -> Result<Order, StoreError> {
        self.select_one("orders", &format!("order_id=eq.{order_id}&select=*"))
            .await?
            .ok_or(StoreError::NotFound)
    }

    async fn orders_for_user(&self, user_id: Uuid) -> Result<Vec<Order>, StoreError> {
        self.select_rows(
            "orders",
            &format!("user_id=eq.{user_id}&select=*&order=placed_at.desc"),
        )
        .await
    }

    async fn items_for_order(&self, order_id: Uuid) -> Result<Vec<OrderItem>, StoreError> {
        self.select_rows("order_items", &format!("order_id=eq.{order_id}&select=*"))
            .await
    }

    async fn delivery_for_order(&self, order_id: Uuid) -> Result<Option<Delivery>, StoreError> {
        self.select_one("deliveries", &format!("order_id=eq.{order_id}&select=*"))
            .await
    }

    async fn payment_for_order(&self, order_id: Uuid) -> Result<Option<Payment>, StoreError> {
        self.select_one("payments", &format!("order_id=eq.{order_id}&select=*"))
            .await
    }

    async fn upsert_delivery_status(
        &self,
        order_id: Uuid,
        status: DeliveryStatus,
        estimated: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut row = json!({
            "order_id": order_id,
            "delivery_status": status.as_str(),
            "updated_at": Utc::now(),
        });
        if let Some(estimated) = estimated {
            row["estimated_delivery_date"] = json!(estimated);
        }
        let response = self
            .authed(
                self.http
                    .post(self.rest_url("deliveries", "on_conflict=order_id")),
            )
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&row)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }
        Ok(())
    }

    async fn listing_by_id(&self, listing_id: Uuid) -> Result<Option<FashionItem>, StoreError> {
        self.select_one("fashion_items", &format!("id=eq.{listing_id}&select=*"))
            .await
    }

    async fn insert_listing(&self, listing: &FashionItem) -> Result<(), StoreError> {
        let row = serde_json::to_value(listing)
            .map_err(|err| StoreError::Deserialize(err.to_string()))?;
        self.insert_row("fashion_items", row).await
    }

    async fn soft_delete_listing(&self, listing_id: Uuid) -> Result<(), StoreError> {
        let matched = self
            .patch_rows(
                "fashion_items",
                &format!("id=eq.{listing_id}"),
                json!({ "deleted_status": true }),
            )
            .await?;
        if matched == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn mark_listing_sold(
        &self,
        listing_id: Uuid,
        status: ListingStatus,
        quantity_sold: u32,
    ) -> Result<bool, StoreError> {
        // The status filter makes the check-then-write a single conditional
        // update; a racing caller matches zero rows instead of re-selling.
        let matched = self
            .patch_rows(
                "fashion_items",
                &format!("id=eq.{listing_id}&status=eq.active"),
                json!({ "status": status.as_str(), "quantity_sold": quantity_sold }),
            )
            .await?;
        Ok(matched > 0)
    }

    async fn set_listing_status(
        &self,
        listing_id: Uuid,
        status: ListingStatus,
    ) -> Result<(), StoreError> {
        let matched = self
            .patch_rows(
                "fashion_items",
                &format!("id=eq.{listing_id}"),
                json!({ "status": status.as_str() }),
            )
            .await?;
        if matched == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn insert_earning(&self, earning: &SellerEarning) -> Result<(), StoreError> {
        let row = serde_json::to_value(earning)
            .map_err(|err| StoreError::Deserialize(err.to_string()))?;
        self.insert_row("seller_earnings", row).await
    }

    async fn earning_by_order_item(
        &self,
        order_item_id: Uuid,
    ) -> Result<Option<SellerEarning>, StoreError> {
        self.select_one(
            "seller_earnings",
            &format!("order_item_id=eq.{order_item_id}&select=*"),
        )
        .await
    }

    async fn earnings_for_seller(&self, seller_id: Uuid) -> Result<Vec<SellerEarning>, StoreError> {
        self.select_rows(
            "seller_earnings",
            &format!("user_id=eq.{seller_id}&select=*&order=sale_date.desc"),
        )
        .await
    }

    async fn mark_earning_paid(&self, earning_id: Uuid) -> Result<bool, StoreError> {
        let matched = self
            .patch_rows(
                "seller_earnings",
                &format!("id=eq.{earning_id}&payment_status=eq.pending"),
                json!({ "payment_status": "paid" }),
            )
            .await?;
        Ok(matched > 0)
    }
}

/// One row of a folder listing. Sub-folder rows carry no `created_at`;
/// object rows do.
#[derive(Debug, Deserialize)]
struct BucketEntry {
    name: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

/// Joins one folder's object rows into full bucket keys, dropping the
/// undated sub-folder rows.
fn objects_in_folder(folder: &str, entries: Vec<BucketEntry>) -> Vec<StoredObject> {
    entries
        .into_iter()
        .filter_map(|entry| {
            entry.created_at.map(|created_at| StoredObject {
                key: format!("{folder}/{}", entry.name),
                created_at,
            })
        })
        .collect()
}

impl ObjectStore for SupabaseClient {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError> {
        let response = self
            .authed(self.http.post(self.storage_object_url(key)))
            .header("Content-Type", content_type.to_string())
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }
        Ok(())
    }

    async fn put_object_multipart(
        &self,
        key: &str,
        file_name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(content_type)
            .map_err(|err| StoreError::Request(err.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self
            .authed(self.http.post(self.storage_object_url(key)))
            .multipart(form)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url,
            self.bucket,
            encode_key(key)
        )
    }

    async fn verify_public(&self, url: &str) -> Result<u64, StoreError> {
        let response = self
            .http
            .head(url)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }
        if let Some(length) = response.content_length().filter(|len| *len > 0) {
            return Ok(length);
        }
        // Some CDN fronts strip the length from HEAD; fall back to a ranged GET.
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        Ok(bytes.len() as u64)
    }

    async fn list_oldest(&self, limit: usize) -> Result<Vec<StoredObject>, StoreError> {
        // Object keys are `{seller}/{file}`, so the root listing yields one
        // folder row per seller; each has to be walked for its objects
        // before anything can be sorted or deleted.
        let root = self.list_folder("", limit).await?;
        let mut objects = Vec::new();
        for entry in root {
            match entry.created_at {
                // A dated root row is a loose object sitting outside any
                // seller prefix.
                Some(created_at) => objects.push(StoredObject {
                    key: entry.name,
                    created_at,
                }),
                None => {
                    let children = self.list_folder(&entry.name, limit).await?;
                    objects.extend(objects_in_folder(&entry.name, children));
                }
            }
        }
        objects.sort_by_key(|o| o.created_at);
        objects.truncate(limit);
        Ok(objects)
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<(), StoreError> {
        let url = format!("{}/storage/v1/object/{}", self.base_url, self.bucket);
        let response = self
            .authed(self.http.delete(url))
            .json(&json!({ "prefixes": keys }))
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_url_keeps_path_segments() {
        let client = SupabaseClient::new("https://demo.supabase.co/", "secret", "product-images");
        let url = client.public_url("seller-1/temp_1700000000000_ab12cd34.jpg");
        assert_eq!(
            url,
            "https://demo.supabase.co/storage/v1/object/public/product-images/seller-1/temp_1700000000000_ab12cd34.jpg"
        );
    }

    #[test]
    fn object_keys_are_segment_encoded() {
        assert_eq!(encode_key("a b/c.jpg"), "a%20b/c.jpg");
        assert_eq!(encode_key("plain/key.png"), "plain/key.png");
    }

    #[test]
    fn folder_walk_emits_full_keys_and_skips_sub_folders() {
        let entries = vec![
            BucketEntry {
                name: "listing_1_ab.jpg".into(),
                created_at: Some(Utc::now()),
            },
            BucketEntry {
                name: "drafts".into(),
                created_at: None,
            },
            BucketEntry {
                name: "listing_2_cd.png".into(),
                created_at: Some(Utc::now()),
            },
        ];
        let objects = objects_in_folder("seller-9", entries);
        assert_eq!(objects.len(), 2);
        for object in &objects {
            assert!(object.key.contains('/'), "deletable keys are seller-scoped");
            assert!(object.key.starts_with("seller-9/"));
        }
    }
}
