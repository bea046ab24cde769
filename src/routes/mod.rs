//! Router assembly.
//!
//! Surfaces: /health, /metrics, /auth/*, the reserved management
//! namespaces, and the fallback proxy entry for everything else. The outer
//! middleware (request metadata, logging, response transform, IP rules)
//! wraps every surface; authentication and rate limiting live inside the
//! proxy entry only.

pub mod auth;
pub mod extractors;
pub mod gateway;
pub mod health;
pub mod middleware;

use crate::context::AppContext;
use crate::error::GatewayError;
use crate::metrics;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    let auth_surface = Router::new()
        .route("/auth/signup", post(auth::signup))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/logout-all", post(auth::logout_all))
        .route("/auth/password", post(auth::change_password))
        .layer(cors_layer(&ctx));

    Router::new()
        .route("/health", get(health::health))
        .route("/health/detailed", get(health::health_detailed))
        .route("/metrics", get(metrics_endpoint))
        .merge(auth_surface)
        .route("/admin", any(gateway::reserved_surface))
        .route("/admin/*path", any(gateway::reserved_surface))
        .route("/developer", any(gateway::reserved_surface))
        .route("/developer/*path", any(gateway::reserved_surface))
        .fallback(gateway::proxy_entry)
        .layer(from_fn_with_state(ctx.clone(), middleware::ip_rules))
        .layer(from_fn(middleware::response_transform))
        .layer(from_fn(middleware::request_logging))
        .layer(from_fn_with_state(ctx.clone(), middleware::request_meta))
        .with_state(ctx)
}

fn cors_layer(ctx: &Arc<AppContext>) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-api-key"),
        ]);

    let origins = &ctx.config.cors_allowed_origins;
    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(parsed))
    }
}

async fn metrics_endpoint() -> axum::response::Response {
    match metrics::gather_metrics() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => GatewayError::Internal(format!("metrics encoding failed: {}", e)).into_response(),
    }
}
