//! Health surface.

use crate::context::AppContext;
use crate::metrics;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEPENDENCY_TIMEOUT: Duration = Duration::from_secs(2);

/// Liveness plus dependency reachability.
pub async fn health(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let (db_ok, _) = check_database(&ctx).await;
    let (cache_ok, _) = check_cache(&ctx).await;

    let healthy = db_ok && cache_ok;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "database": up_or_down(db_ok),
            "cache": up_or_down(cache_ok),
        })),
    )
}

/// Per-dependency latency and a request-stats snapshot.
pub async fn health_detailed(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    let (db_ok, db_latency) = check_database(&ctx).await;
    let (cache_ok, cache_latency) = check_cache(&ctx).await;
    let stats = metrics::stats_snapshot(&ctx.cache).await;

    let healthy = db_ok && cache_ok;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "dependencies": {
                "database": {
                    "status": up_or_down(db_ok),
                    "latency_ms": db_latency.as_millis() as u64,
                },
                "cache": {
                    "status": up_or_down(cache_ok),
                    "latency_ms": cache_latency.as_millis() as u64,
                },
            },
            "requests": stats,
        })),
    )
}

async fn check_database(ctx: &AppContext) -> (bool, Duration) {
    let started = Instant::now();
    let outcome = tokio::time::timeout(
        DEPENDENCY_TIMEOUT,
        sqlx::query("SELECT 1").execute(&ctx.db),
    )
    .await;
    (matches!(outcome, Ok(Ok(_))), started.elapsed())
}

async fn check_cache(ctx: &AppContext) -> (bool, Duration) {
    let mut cache = ctx.cache.clone();
    let started = Instant::now();
    let outcome = tokio::time::timeout(DEPENDENCY_TIMEOUT, cache.ping()).await;
    (matches!(outcome, Ok(Ok(_))), started.elapsed())
}

fn up_or_down(ok: bool) -> &'static str {
    if ok {
        "up"
    } else {
        "down"
    }
}
