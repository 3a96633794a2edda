use tracing::trace;

// Lightweight metrics helpers. Emitted as trace events so the Prometheus
// recorder stays optional and deps stay stable.

pub fn inc_requests(route: &'static str) {
    trace!(target = "relove.metrics", route = route, "requests_total_inc");
}

pub fn request_elapsed(route: &'static str, elapsed_ms: u128) {
    trace!(
        target = "relove.metrics",
        route = route,
        elapsed_ms = elapsed_ms as u64,
        "request_elapsed"
    );
}
