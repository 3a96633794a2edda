use crate::earnings::EarningsReport;
use redis::AsyncCommands;

/// Replay cache for the checkout webhook: a retried `Idempotency-Key` gets
/// the original recognition report back instead of a second ledger pass.
/// Redis being down degrades to the in-process map in `AppState`.
pub async fn redis_get(client: &redis::Client, key: &str) -> Option<EarningsReport> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(_) => return None,
    };
    let s: Option<String> = conn.get(cache_key(key)).await.ok();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

pub async fn redis_set(
    client: &redis::Client,
    key: &str,
    value: &EarningsReport,
    ttl_secs: u64,
) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(cache_key(key), json, ttl_secs).await;
    }
}

fn cache_key(key: &str) -> String {
    format!("relove:recognize:{key}")
}
