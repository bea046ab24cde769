//! Request metrics.
//!
//! Prometheus counters and histograms cover the local process; coarse
//! aggregate counters in the shared cache (`stats:*`, one-day TTL) feed the
//! health surface's request-stats snapshot across instances.

use crate::cache::SharedCache;
use crate::config::SECONDS_PER_DAY;
use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{
    opts, register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};
use serde_json::{json, Value};

pub static REQUESTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "portcullis_requests_total",
        "Total number of requests processed"
    ))
    .unwrap()
});

pub static REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("portcullis_requests", "Requests by route, method and status"),
        &["route", "method", "status"]
    )
    .unwrap()
});

pub static ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("portcullis_errors_total", "Gateway errors by classified kind"),
        &["kind"]
    )
    .unwrap()
});

/// Upstream latency per route. Buckets align with the reporting bands
/// 0–10 / 11–50 / 51–100 / 101–500 / 501–1000 / 1000+ ms.
pub static UPSTREAM_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "portcullis_upstream_latency_seconds",
        "Upstream response time by route",
        &["route"],
        vec![0.010, 0.050, 0.100, 0.500, 1.000]
    )
    .unwrap()
});

pub fn observe_request(route: &str, method: &str, status: u16, latency_secs: f64) {
    REQUESTS_TOTAL.inc();
    REQUESTS
        .with_label_values(&[route, method, &status.to_string()])
        .inc();
    UPSTREAM_LATENCY
        .with_label_values(&[route])
        .observe(latency_secs);
}

pub fn observe_error(kind: &str) {
    ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}

// ============================================================================
// Shared aggregate counters
// ============================================================================

const BUMP_STAT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Fire-and-forget aggregate bump; callers spawn this off the hot path.
pub async fn bump_shared_stats(mut cache: SharedCache, status: u16) {
    let class = format!("stats:status:{}xx", status / 100);
    for key in ["stats:requests".to_string(), class] {
        let script = redis::Script::new(BUMP_STAT);
        let outcome: Result<i64, _> = script
            .key(&key)
            .arg(SECONDS_PER_DAY)
            .invoke_async(cache.connection_mut())
            .await;
        if let Err(e) = outcome {
            tracing::debug!(key = %key, error = %e, "stats counter not bumped");
            return;
        }
    }
}

/// Snapshot for `/health/detailed`. Counters reset implicitly on TTL expiry.
pub async fn stats_snapshot(cache: &SharedCache) -> Value {
    let mut cache = cache.clone();
    let mut snapshot = serde_json::Map::new();

    for (field, key) in [
        ("requests_today", "stats:requests"),
        ("status_2xx", "stats:status:2xx"),
        ("status_4xx", "stats:status:4xx"),
        ("status_5xx", "stats:status:5xx"),
    ] {
        let value: i64 = cache.get(key).await.ok().flatten().unwrap_or(0);
        snapshot.insert(field.to_string(), json!(value));
    }

    Value::Object(snapshot)
}
