mod earnings;
mod fulfillment;
mod http;
mod idempotency;
mod jobs;
mod listings;
mod metrics;
mod models;
mod retention;
mod security;
mod store;
mod supabase;
mod upload;

use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use earnings::{EarningsReport, SellerEarningsLedger, ShipmentOutcome};
use fulfillment::{FulfillmentEvent, OrderFulfillmentEngine, TransitionOutcome};
use listings::{ListingStore, NewListing};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, FashionItem, Order, OrderDetail, SellerStats};
use retention::{StorageRetentionSweeper, SweepReport};
use security::{AuthState, CallerContext, require_api_auth};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use store::StoreError;
use supabase::SupabaseClient;
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use upload::ListingUploadPipeline;
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "relove.api", "server crashed: {err}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let supabase = SupabaseClient::from_env()
        .ok_or_else(|| eyre::eyre!("SUPABASE_URL and a service role key are required"))?;
    let auth_state = AuthState::from_env();

    let fulfillment = Arc::new(OrderFulfillmentEngine::new(supabase.clone()));
    spawn_event_logger(&fulfillment);
    let _sweeper_handle =
        jobs::spawn_retention_sweeper(StorageRetentionSweeper::new(supabase.clone()));

    let openapi: serde_json::Value = serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or(json!({"openapi": "3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|url| redis::Client::open(url).ok());

    let state = AppState {
        fulfillment,
        ledger: Arc::new(SellerEarningsLedger::new(supabase.clone())),
        listings: Arc::new(ListingStore::new(supabase.clone())),
        uploads: Arc::new(ListingUploadPipeline::new(supabase.clone())),
        sweeper: Arc::new(StorageRetentionSweeper::new(supabase)),
        openapi: Arc::new(openapi),
        idempotency: Arc::new(Mutex::new(HashMap::new())),
        prometheus_handle,
        redis,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/listings", post(create_listing))
        .route("/listings/{id}", delete(delete_listing))
        .route("/users/{id}/orders", get(user_orders))
        .route("/orders/{id}", get(order_detail))
        .route("/orders/{id}/place", post(place_order))
        .route("/orders/{id}/cancel", post(cancel_order))
        .route("/orders/{id}/recognize", post(recognize_order))
        .route("/earnings/{id}/shipped", post(earning_shipped))
        .route("/sellers/{id}/stats", get(seller_stats))
        .route("/maintenance/sweep", post(run_sweep))
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "relove.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    fulfillment: Arc<OrderFulfillmentEngine<SupabaseClient>>,
    ledger: Arc<SellerEarningsLedger<SupabaseClient>>,
    listings: Arc<ListingStore<SupabaseClient>>,
    uploads: Arc<ListingUploadPipeline<SupabaseClient>>,
    sweeper: Arc<StorageRetentionSweeper<SupabaseClient>>,
    openapi: Arc<serde_json::Value>,
    idempotency: Arc<Mutex<HashMap<String, EarningsReport>>>,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
}

/// Seller notifications ride the fulfillment event channel; for now the only
/// consumer is this log bridge.
fn spawn_event_logger(engine: &Arc<OrderFulfillmentEngine<SupabaseClient>>) {
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                FulfillmentEvent::OrderPlaced { order_id } => {
                    info!(target = "relove.notify", order_id = %order_id, "order placed")
                }
                FulfillmentEvent::OrderCancelled { order_id } => {
                    info!(target = "relove.notify", order_id = %order_id, "order cancelled")
                }
            }
        }
    });
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "relove-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Unauthorized);
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Relove API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap_or_default()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(2 * 1024 * 1024)
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap_or_default();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct CreateListingRequest {
    #[serde(flatten)]
    listing: NewListing,
    #[serde(default)]
    images: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CreateListingResponse {
    listing: FashionItem,
    images_uploaded: usize,
}

/// Create a marketplace listing, uploading its photos first.
///
/// - Method: `POST`
/// - Path: `/listings`
/// - Auth: `Authorization: Bearer <key>` or `X-Relove-Key: <key>`
/// - Body: listing fields plus an `images` array of data URIs or URLs
async fn create_listing(
    State(state): State<AppState>,
    Extension(context): Extension<CallerContext>,
    Json(payload): Json<CreateListingRequest>,
) -> Result<Json<CreateListingResponse>, AppError> {
    crate::metrics::inc_requests("/listings");
    let start = std::time::Instant::now();
    info!(
        target = "relove.api",
        caller = %context.caller_id,
        api_key = %context.api_key_id,
        seller_id = %payload.listing.user_id,
        images = payload.images.len(),
        "listing creation invoked",
    );

    let outcome = state
        .uploads
        .upload_many(&payload.images, payload.listing.user_id, None)
        .await;
    if !outcome.success {
        return Err(AppError::UploadFailed);
    }
    let urls = outcome.urls.unwrap_or_default();
    let images_uploaded = urls.len();
    let listing = state.listings.create(payload.listing, urls).await?;
    crate::metrics::request_elapsed("/listings", start.elapsed().as_millis());
    Ok(Json(CreateListingResponse {
        listing,
        images_uploaded,
    }))
}

async fn delete_listing(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/listings/delete");
    state.listings.soft_delete(id).await?;
    Ok(Json(json!({"deleted": true, "id": id})))
}

async fn user_orders(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Order>>, AppError> {
    crate::metrics::inc_requests("/users/orders");
    Ok(Json(state.fulfillment.orders_for_user(id).await?))
}

async fn order_detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<OrderDetail>, AppError> {
    crate::metrics::inc_requests("/orders/detail");
    Ok(Json(state.fulfillment.order_detail(id).await?))
}

async fn place_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TransitionOutcome>, AppError> {
    crate::metrics::inc_requests("/orders/place");
    Ok(Json(state.fulfillment.mark_placed(id).await?))
}

async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TransitionOutcome>, AppError> {
    crate::metrics::inc_requests("/orders/cancel");
    Ok(Json(state.fulfillment.cancel(id).await?))
}

/// Checkout webhook: converts a captured order into seller earnings. Retried
/// deliveries send the same `Idempotency-Key` and get the stored report back.
async fn recognize_order(
    State(state): State<AppState>,
    Extension(context): Extension<CallerContext>,
    headers: axum::http::HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<EarningsReport>, AppError> {
    crate::metrics::inc_requests("/orders/recognize");
    let start = std::time::Instant::now();
    info!(
        target = "relove.api",
        caller = %context.caller_id,
        order_id = %id,
        "earnings recognition invoked",
    );

    if let Some(key) = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        if let Some(client) = &state.redis {
            if let Some(existing) = idempotency::redis_get(client, &key).await {
                return Ok(Json(existing));
            }
            let report = state.ledger.recognize_earnings(id).await?;
            let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(3600);
            idempotency::redis_set(client, &key, &report, ttl).await;
            return Ok(Json(report));
        }
        if let Some(existing) = state.idempotency.lock().await.get(&key).cloned() {
            return Ok(Json(existing));
        }
        let report = state.ledger.recognize_earnings(id).await?;
        state.idempotency.lock().await.insert(key, report.clone());
        return Ok(Json(report));
    }

    let report = state.ledger.recognize_earnings(id).await?;
    crate::metrics::request_elapsed("/orders/recognize", start.elapsed().as_millis());
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct ShippedRequest {
    listing_id: Uuid,
}

async fn earning_shipped(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ShippedRequest>,
) -> Result<Json<ShipmentOutcome>, AppError> {
    crate::metrics::inc_requests("/earnings/shipped");
    Ok(Json(
        state.ledger.mark_shipped(id, payload.listing_id).await?,
    ))
}

async fn seller_stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SellerStats>, AppError> {
    crate::metrics::inc_requests("/sellers/stats");
    Ok(Json(state.ledger.seller_stats(id).await?))
}

#[derive(Debug, Deserialize, Default)]
struct SweepRequest {
    #[serde(default)]
    max_items: Option<usize>,
}

/// Manual trigger for the retention sweep, for ops use between scheduled
/// runs.
async fn run_sweep(
    State(state): State<AppState>,
    payload: Option<Json<SweepRequest>>,
) -> Result<Json<SweepReport>, AppError> {
    crate::metrics::inc_requests("/maintenance/sweep");
    let max_items = payload
        .and_then(|Json(req)| req.max_items)
        .unwrap_or_else(max_delete_default);
    let report = state.sweeper.sweep(max_items).await?;
    Ok(Json(report))
}

fn max_delete_default() -> usize {
    std::env::var("RETENTION_MAX_DELETE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(100)
}

#[derive(Debug)]
enum AppError {
    Store(StoreError),
    Sweep(retention::SweepError),
    UploadFailed,
    Unauthorized,
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<retention::SweepError> for AppError {
    fn from(value: retention::SweepError) -> Self {
        Self::Sweep(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match self {
            AppError::Store(StoreError::NotFound) => {
                (StatusCode::NOT_FOUND, "not_found", None)
            }
            AppError::Store(StoreError::Conflict) => {
                (StatusCode::CONFLICT, "conflict", None)
            }
            AppError::Store(err) => (
                StatusCode::BAD_GATEWAY,
                "upstream_unavailable",
                Some(err.to_string()),
            ),
            AppError::Sweep(err) => (
                StatusCode::BAD_GATEWAY,
                "sweep_failed",
                Some(err.to_string()),
            ),
            AppError::UploadFailed => (
                StatusCode::BAD_GATEWAY,
                "image_upload_failed",
                Some("no upload method produced a verified URL".to_string()),
            ),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
        };
        let payload = ApiError {
            error: code.to_string(),
            detail,
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_responses_carry_the_right_status() {
        let cases = [
            (AppError::Store(StoreError::NotFound), StatusCode::NOT_FOUND),
            (AppError::Store(StoreError::Conflict), StatusCode::CONFLICT),
            (
                AppError::Store(StoreError::Request("down".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (AppError::UploadFailed, StatusCode::BAD_GATEWAY),
            (AppError::Unauthorized, StatusCode::UNAUTHORIZED),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
