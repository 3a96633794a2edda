use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Who is calling: the checkout collaborator, the mobile backend, an ops
/// tool. Attached as a request extension after authentication.
#[derive(Clone, Debug)]
pub struct CallerContext {
    pub caller_id: String,
    pub api_key_id: String,
}

#[derive(Clone)]
struct CallerRecord {
    caller_id: String,
    api_key_id: String,
}

#[derive(Clone)]
pub struct AuthState {
    records: Arc<HashMap<String, CallerRecord>>,
    limiter: Arc<TokenBuckets>,
}

impl AuthState {
    pub fn from_env() -> Self {
        Self {
            records: Arc::new(load_keys_from_env()),
            limiter: Arc::new(TokenBuckets::from_env()),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<CallerContext> {
        self.records.get(presented).map(|record| CallerContext {
            caller_id: record.caller_id.clone(),
            api_key_id: record.api_key_id.clone(),
        })
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "missing_api_key",
            "Provide X-Relove-Key or a Bearer token",
        ));
    };
    let Some(context) = state.authenticate(&presented) else {
        return Ok(error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_api_key",
            "Key not recognized",
        ));
    };

    let rate = state.limiter.consume(&context.caller_id).await;
    if rate.allowed {
        request.extensions_mut().insert(context);
        let mut response = next.run(request).await;
        rate.apply_headers(response.headers_mut());
        Ok(response)
    } else {
        let mut response = error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "Too many requests",
        );
        rate.apply_headers(response.headers_mut());
        Ok(response)
    }
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Relove-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (status, Json(payload)).into_response()
}

/// `SERVICE_API_KEYS` is `caller:secret[,caller:secret...]`.
fn load_keys_from_env() -> HashMap<String, CallerRecord> {
    let raw = env::var("SERVICE_API_KEYS").unwrap_or_else(|_| "dev:dev-key".to_string());
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let caller = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let secret = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (caller, secret) {
            (Some(caller), Some(secret)) => {
                entries.insert(
                    secret.to_string(),
                    CallerRecord {
                        caller_id: caller.to_string(),
                        api_key_id: format!("key-{:02}", idx + 1),
                    },
                );
            }
            _ => warn!(
                target = "relove.api",
                "ignored malformed SERVICE_API_KEYS entry: {trimmed}"
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target = "relove.api",
            "SERVICE_API_KEYS produced no keys; falling back to dev credentials"
        );
        entries.insert(
            "dev-key".to_string(),
            CallerRecord {
                caller_id: "dev".to_string(),
                api_key_id: "key-01".to_string(),
            },
        );
    } else {
        info!(
            target = "relove.api",
            key_count = entries.len(),
            "loaded API keys from env"
        );
    }
    entries
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<String, BucketState>>,
}

/// Outcome of one token-bucket draw, also used to stamp the rate headers on
/// the way out.
pub struct RateStatus {
    allowed: bool,
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl TokenBuckets {
    fn from_env() -> Self {
        let rate_per_sec = env::var("RATE_LIMIT_PER_SEC")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value > 0.0)
            .unwrap_or(5.0);
        let capacity = env::var("RATE_LIMIT_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value >= 1.0)
            .unwrap_or(10.0);
        Self {
            rate_per_sec,
            capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    async fn consume(&self, key: &str) -> RateStatus {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let state = guard.entry(key.to_string()).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        let allowed = state.tokens >= 1.0;
        if allowed {
            state.tokens -= 1.0;
        }
        RateStatus {
            allowed,
            capacity: self.capacity,
            tokens: state.tokens,
            rate: self.rate_per_sec,
        }
    }
}

impl RateStatus {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let remaining = self.tokens.max(0.0).floor() as u64;
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        headers.insert(
            "X-RateLimit-Limit",
            numeric_header(self.capacity as u64),
        );
        headers.insert("X-RateLimit-Remaining", numeric_header(remaining));
        headers.insert("X-RateLimit-Reset", numeric_header(reset));
        if !self.allowed {
            let retry = ((1.0 - self.tokens) / self.rate).ceil().max(0.0) as u64;
            headers.insert(http::header::RETRY_AFTER, numeric_header(retry.max(1)));
        }
    }
}

fn numeric_header(value: u64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}
