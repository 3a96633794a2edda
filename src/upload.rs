use crate::http::shared_client;
use crate::store::{ObjectStore, StoreError};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Internal upload failure. Carries the cause for structured logging; it is
/// never surfaced past the pipeline boundary.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("could not decode source: {0}")]
    Decode(String),
    #[error("source produced an empty payload via {0}")]
    EmptyPayload(&'static str),
    #[error("storage call failed: {0}")]
    Storage(#[from] StoreError),
    #[error("uploaded object failed verification: {0}")]
    Verify(String),
}

/// Where a listing photo comes from. Mobile clients hand us data URIs or
/// remote URLs; batch import jobs hand us local paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    DataUri(String),
    Remote(String),
    Path(String),
}

impl ImageSource {
    pub fn parse(uri: &str) -> Self {
        let trimmed = uri.trim();
        if trimmed.starts_with("data:") {
            ImageSource::DataUri(trimmed.to_string())
        } else if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            ImageSource::Remote(trimmed.to_string())
        } else {
            ImageSource::Path(trimmed.trim_start_matches("file://").to_string())
        }
    }
}

/// Binary payload ready for upload.
#[derive(Debug, Clone)]
pub struct MediaPayload {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Turns a local image reference into upload-ready bytes. Several runtime
/// paths for this have historically produced empty buffers, so every decode
/// path ends in a non-empty check and callers keep alternates to fall back
/// on.
#[derive(Clone)]
pub struct MediaBlobCodec {
    http: Client,
}

impl Default for MediaBlobCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaBlobCodec {
    pub fn new() -> Self {
        Self {
            http: shared_client(),
        }
    }

    /// Primary decode path for each source kind.
    pub async fn materialize(&self, uri: &str) -> Result<MediaPayload, UploadError> {
        let payload = match ImageSource::parse(uri) {
            ImageSource::DataUri(data) => decode_data_uri(&data)?,
            ImageSource::Remote(url) => {
                let bytes = self.fetch(&url).await?;
                MediaPayload {
                    bytes,
                    content_type: sniff(uri).1.to_string(),
                }
            }
            ImageSource::Path(path) => {
                let bytes = tokio::fs::read(&path)
                    .await
                    .map_err(|err| UploadError::Decode(err.to_string()))?;
                MediaPayload {
                    bytes,
                    content_type: sniff(uri).1.to_string(),
                }
            }
        };
        ensure_non_empty(payload, "direct")
    }

    /// Round-trips the payload through base64 into a fresh buffer. Guards
    /// against the zero-length aliased buffers the direct path can produce.
    pub fn rewrap(payload: &MediaPayload) -> Result<MediaPayload, UploadError> {
        let encoded = BASE64.encode(&payload.bytes);
        let bytes = BASE64
            .decode(encoded.as_bytes())
            .map_err(|err| UploadError::Decode(err.to_string()))?;
        ensure_non_empty(
            MediaPayload {
                bytes,
                content_type: payload.content_type.clone(),
            },
            "base64-rewrap",
        )
    }

    /// Base64 straight to a raw byte array, bypassing any blob wrapper. Only
    /// data URIs support this path.
    pub fn raw_bytes(uri: &str) -> Option<Result<MediaPayload, UploadError>> {
        match ImageSource::parse(uri) {
            ImageSource::DataUri(data) => {
                Some(decode_data_uri(&data).and_then(|p| ensure_non_empty(p, "raw-bytes")))
            }
            _ => None,
        }
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, UploadError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| UploadError::Decode(err.to_string()))?;
        if !response.status().is_success() {
            return Err(UploadError::Decode(format!("HTTP {}", response.status())));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| UploadError::Decode(err.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// Alternate buffer path: accumulates chunks instead of one contiguous
    /// body read. Used as the internal retry of the generic fetch strategy.
    async fn fetch_chunked(&self, url: &str) -> Result<Vec<u8>, UploadError> {
        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| UploadError::Decode(err.to_string()))?;
        if !response.status().is_success() {
            return Err(UploadError::Decode(format!("HTTP {}", response.status())));
        }
        let mut buffer = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| UploadError::Decode(err.to_string()))?
        {
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer)
    }
}

fn decode_data_uri(data: &str) -> Result<MediaPayload, UploadError> {
    let rest = data
        .strip_prefix("data:")
        .ok_or_else(|| UploadError::Decode("not a data uri".into()))?;
    let (header, body) = rest
        .split_once(',')
        .ok_or_else(|| UploadError::Decode("data uri has no payload".into()))?;
    let content_type = header
        .split(';')
        .next()
        .filter(|mime| !mime.is_empty())
        .unwrap_or("image/jpeg")
        .to_string();
    let bytes = if header.contains("base64") {
        BASE64
            .decode(body.as_bytes())
            .map_err(|err| UploadError::Decode(err.to_string()))?
    } else {
        urlencoding::decode(body)
            .map_err(|err| UploadError::Decode(err.to_string()))?
            .into_owned()
            .into_bytes()
    };
    Ok(MediaPayload {
        bytes,
        content_type,
    })
}

fn ensure_non_empty(payload: MediaPayload, path: &'static str) -> Result<MediaPayload, UploadError> {
    if payload.bytes.is_empty() {
        Err(UploadError::EmptyPayload(path))
    } else {
        Ok(payload)
    }
}

/// `(extension, mime)` sniffed from the source reference.
pub fn sniff(uri: &str) -> (&'static str, &'static str) {
    let lowered = uri.to_lowercase();
    if lowered.starts_with("data:image/png") || lowered.ends_with(".png") {
        ("png", "image/png")
    } else if lowered.ends_with(".jpeg") {
        ("jpeg", "image/jpeg")
    } else {
        ("jpg", "image/jpeg")
    }
}

/// `{seller}/{listing|temp}_{millis}_{token}.{ext}` — globally unique without
/// any coordination.
pub fn object_key(seller_id: Uuid, listing_id: Option<Uuid>, ext: &str) -> String {
    let scope = listing_id
        .map(|id| id.simple().to_string())
        .unwrap_or_else(|| "temp".to_string());
    let token: u32 = SmallRng::from_os_rng().random();
    format!(
        "{seller_id}/{scope}_{millis}_{token:08x}.{ext}",
        millis = Utc::now().timestamp_millis()
    )
}

/// One self-contained way of getting a source reference into the bucket.
/// Tried strictly in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    /// Pass the materialized reference straight to the storage client.
    StructuredReference,
    /// Read, then round-trip through base64 into a fresh buffer.
    Base64Rewrap,
    /// Decode base64 directly to raw bytes with an explicit content type.
    RawBytes,
    /// Multipart/form-data file object upload.
    MultipartForm,
    /// Generic fetch-to-buffer, retried once through the chunked path when
    /// the first buffer comes back empty.
    FetchToBlob,
}

impl UploadStrategy {
    pub const ORDER: [UploadStrategy; 5] = [
        UploadStrategy::StructuredReference,
        UploadStrategy::Base64Rewrap,
        UploadStrategy::RawBytes,
        UploadStrategy::MultipartForm,
        UploadStrategy::FetchToBlob,
    ];

    pub fn name(self) -> &'static str {
        match self {
            UploadStrategy::StructuredReference => "structured_reference",
            UploadStrategy::Base64Rewrap => "base64_rewrap",
            UploadStrategy::RawBytes => "raw_bytes",
            UploadStrategy::MultipartForm => "multipart_form",
            UploadStrategy::FetchToBlob => "fetch_to_blob",
        }
    }
}

/// Wholesale batch methods tried by `upload_many`, coarser than the per-image
/// chain because some failure modes (a revoked permission, a broken bridge)
/// are systemic rather than per-file.
const BATCH_METHODS: [(&str, UploadStrategy); 4] = [
    ("direct", UploadStrategy::StructuredReference),
    ("filesystem", UploadStrategy::Base64Rewrap),
    ("form_data", UploadStrategy::MultipartForm),
    ("generic", UploadStrategy::FetchToBlob),
];

/// Outward result shape. Callers never see an error value; a person posting
/// a listing gets a retry prompt, not a storage stack trace.
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
}

impl UploadOutcome {
    fn failed() -> Self {
        Self {
            success: false,
            urls: None,
        }
    }
}

/// Uploads listing photos with maximum resilience: an ordered strategy chain
/// per image, a wholesale method chain per batch, and verified public URLs
/// on the way out.
pub struct ListingUploadPipeline<O> {
    codec: MediaBlobCodec,
    sink: O,
}

impl<O: ObjectStore> ListingUploadPipeline<O> {
    pub fn new(sink: O) -> Self {
        Self {
            codec: MediaBlobCodec::new(),
            sink,
        }
    }

    /// Tries every strategy in order and reports the first verified URL.
    /// Exhaustion is `None`; causes are logged, never propagated.
    pub async fn upload_one(
        &self,
        uri: &str,
        seller_id: Uuid,
        listing_id: Option<Uuid>,
    ) -> Option<String> {
        for strategy in UploadStrategy::ORDER {
            match self.attempt(strategy, uri, seller_id, listing_id).await {
                Ok(url) => {
                    info!(
                        target = "relove.upload",
                        strategy = strategy.name(),
                        seller_id = %seller_id,
                        "image uploaded"
                    );
                    return Some(url);
                }
                Err(err) => {
                    warn!(
                        target = "relove.upload",
                        strategy = strategy.name(),
                        seller_id = %seller_id,
                        error = %err,
                        "upload strategy failed, trying next"
                    );
                }
            }
        }
        warn!(
            target = "relove.upload",
            seller_id = %seller_id,
            "all upload strategies exhausted for image"
        );
        None
    }

    /// Uploads a whole batch via the wholesale method chain: each method must
    /// succeed for every image, otherwise the next method is tried from
    /// scratch.
    pub async fn upload_many(
        &self,
        uris: &[String],
        seller_id: Uuid,
        listing_id: Option<Uuid>,
    ) -> UploadOutcome {
        if uris.is_empty() {
            return UploadOutcome {
                success: true,
                urls: Some(Vec::new()),
            };
        }

        'methods: for (method, strategy) in BATCH_METHODS {
            let mut urls = Vec::with_capacity(uris.len());
            for uri in uris {
                match self.attempt(strategy, uri, seller_id, listing_id).await {
                    Ok(url) => urls.push(url),
                    Err(err) => {
                        warn!(
                            target = "relove.upload",
                            method,
                            seller_id = %seller_id,
                            error = %err,
                            "batch method failed, falling back"
                        );
                        continue 'methods;
                    }
                }
            }
            info!(
                target = "relove.upload",
                method,
                count = urls.len(),
                seller_id = %seller_id,
                "image batch uploaded"
            );
            return UploadOutcome {
                success: true,
                urls: Some(urls),
            };
        }

        warn!(
            target = "relove.upload",
            seller_id = %seller_id,
            count = uris.len(),
            "every batch upload method failed"
        );
        UploadOutcome::failed()
    }

    /// One full attempt: materialize, upload under a fresh key, build the
    /// public URL, verify it serves non-zero content.
    async fn attempt(
        &self,
        strategy: UploadStrategy,
        uri: &str,
        seller_id: Uuid,
        listing_id: Option<Uuid>,
    ) -> Result<String, UploadError> {
        let (ext, mime) = sniff(uri);
        let key = object_key(seller_id, listing_id, ext);

        match strategy {
            UploadStrategy::StructuredReference => {
                let payload = self.codec.materialize(uri).await?;
                self.sink
                    .put_object(&key, payload.bytes, &payload.content_type)
                    .await?;
            }
            UploadStrategy::Base64Rewrap => {
                let payload = self.codec.materialize(uri).await?;
                let fresh = MediaBlobCodec::rewrap(&payload)?;
                self.sink
                    .put_object(&key, fresh.bytes, &fresh.content_type)
                    .await?;
            }
            UploadStrategy::RawBytes => {
                let payload = MediaBlobCodec::raw_bytes(uri)
                    .ok_or(UploadError::Decode("source is not base64-backed".into()))??;
                // Explicit content type from the sniffed extension, not the
                // payload header.
                self.sink.put_object(&key, payload.bytes, mime).await?;
            }
            UploadStrategy::MultipartForm => {
                let payload = self.codec.materialize(uri).await?;
                let file_name = format!("upload.{ext}");
                self.sink
                    .put_object_multipart(&key, &file_name, payload.bytes, &payload.content_type)
                    .await?;
            }
            UploadStrategy::FetchToBlob => {
                let payload = match ImageSource::parse(uri) {
                    ImageSource::Remote(url) => {
                        let mut bytes = self.codec.fetch(&url).await?;
                        if bytes.is_empty() {
                            bytes = self.codec.fetch_chunked(&url).await?;
                        }
                        ensure_non_empty(
                            MediaPayload {
                                bytes,
                                content_type: mime.to_string(),
                            },
                            "fetch-to-blob",
                        )?
                    }
                    _ => {
                        let direct = self.codec.materialize(uri).await?;
                        MediaBlobCodec::rewrap(&direct)?
                    }
                };
                self.sink
                    .put_object(&key, payload.bytes, &payload.content_type)
                    .await?;
            }
        }

        let url = self.sink.public_url(&key);
        let length = self.sink.verify_public(&url).await?;
        if length == 0 {
            return Err(UploadError::Verify(format!(
                "{url} served zero-length content"
            )));
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::MemBucket;
    use std::sync::atomic::Ordering;

    const PNG_URI: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUg==";
    const JPG_URI: &str = "data:image/jpeg;base64,/9j/4AAQSkZJRg==";

    fn uris(n: usize) -> Vec<String> {
        (0..n).map(|_| JPG_URI.to_string()).collect()
    }

    #[test]
    fn source_parsing_covers_the_three_reference_kinds() {
        assert!(matches!(
            ImageSource::parse("data:image/png;base64,AAAA"),
            ImageSource::DataUri(_)
        ));
        assert!(matches!(
            ImageSource::parse("https://cdn.example/a.jpg"),
            ImageSource::Remote(_)
        ));
        assert_eq!(
            ImageSource::parse("file:///tmp/shot.jpg"),
            ImageSource::Path("/tmp/shot.jpg".into())
        );
    }

    #[test]
    fn extension_sniffing_defaults_to_jpg() {
        assert_eq!(sniff("photo.PNG").0, "png");
        assert_eq!(sniff("photo.jpeg").0, "jpeg");
        assert_eq!(sniff("photo.heic").0, "jpg");
        assert_eq!(sniff(PNG_URI).1, "image/png");
    }

    #[test]
    fn object_keys_carry_scope_timestamp_and_token() {
        let seller = Uuid::new_v4();
        let listing = Uuid::new_v4();
        let key = object_key(seller, Some(listing), "png");
        let (prefix, rest) = key.split_once('/').expect("seller prefix");
        assert_eq!(prefix, seller.to_string());
        assert!(rest.starts_with(&listing.simple().to_string()));
        assert!(rest.ends_with(".png"));
        assert_eq!(rest.split('_').count(), 3);

        let temp_key = object_key(seller, None, "jpg");
        assert!(temp_key.contains("/temp_"));
    }

    #[test]
    fn codec_rewrap_copies_into_a_fresh_buffer() {
        let payload = MediaPayload {
            bytes: vec![1, 2, 3],
            content_type: "image/jpeg".into(),
        };
        let fresh = MediaBlobCodec::rewrap(&payload).unwrap();
        assert_eq!(fresh.bytes, payload.bytes);
    }

    #[tokio::test]
    async fn codec_rejects_empty_data_uris() {
        let codec = MediaBlobCodec::new();
        let err = codec.materialize("data:image/png;base64,").await.unwrap_err();
        assert!(matches!(err, UploadError::EmptyPayload(_)));
    }

    #[tokio::test]
    async fn upload_one_stores_and_verifies_a_single_image() {
        let bucket = MemBucket::default();
        let pipeline = ListingUploadPipeline::new(bucket.clone());
        let url = pipeline
            .upload_one(PNG_URI, Uuid::new_v4(), None)
            .await
            .expect("upload succeeds");
        assert!(url.starts_with("mem://bucket/"));
        assert_eq!(bucket.len(), 1);
    }

    #[tokio::test]
    async fn upload_one_swallows_total_failure() {
        let bucket = MemBucket::default();
        bucket.failing_puts.store(100, Ordering::SeqCst);
        let pipeline = ListingUploadPipeline::new(bucket.clone());
        let result = pipeline.upload_one(JPG_URI, Uuid::new_v4(), None).await;
        assert!(result.is_none());
        assert_eq!(bucket.len(), 0);
    }

    #[tokio::test]
    async fn batch_falls_back_to_the_next_method_and_succeeds_for_all() {
        let bucket = MemBucket::default();
        // First put fails, so the "direct" method aborts; "filesystem" then
        // carries the whole batch.
        bucket.failing_puts.store(1, Ordering::SeqCst);
        let pipeline = ListingUploadPipeline::new(bucket.clone());

        let outcome = pipeline
            .upload_many(&uris(3), Uuid::new_v4(), None)
            .await;
        assert!(outcome.success);
        let urls = outcome.urls.expect("urls on success");
        assert_eq!(urls.len(), 3);
        assert_eq!(bucket.len(), 3);
        for url in urls {
            let length = bucket.verify_public(&url).await.unwrap();
            assert!(length > 0);
        }
    }

    #[tokio::test]
    async fn batch_exhaustion_reports_plain_failure() {
        let bucket = MemBucket::default();
        bucket.failing_puts.store(100, Ordering::SeqCst);
        let pipeline = ListingUploadPipeline::new(bucket.clone());

        let outcome = pipeline
            .upload_many(&uris(2), Uuid::new_v4(), None)
            .await;
        assert!(!outcome.success);
        assert!(outcome.urls.is_none());
    }

    #[tokio::test]
    async fn empty_batch_is_a_trivial_success() {
        let pipeline = ListingUploadPipeline::new(MemBucket::default());
        let outcome = pipeline.upload_many(&[], Uuid::new_v4(), None).await;
        assert!(outcome.success);
        assert_eq!(outcome.urls.unwrap().len(), 0);
    }
}
