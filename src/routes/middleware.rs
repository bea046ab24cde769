//! Pipeline middleware.
//!
//! Ordering (outermost first): request metadata, request logging, response
//! transform, IP rules. Authentication and rate limiting run inside the
//! proxy entry handler because they need the matched route; the surfaces
//! under /health, /auth, /metrics and the reserved management namespaces
//! bypass them by construction.

use crate::context::AppContext;
use crate::error::GatewayError;
use crate::utils::{add_security_headers, extract_client_ip, is_hop_by_hop};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Per-request metadata accumulated by the parser stage and carried in the
/// request extensions.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
    pub client_ip: String,
    pub start: Instant,
}

/// Stage 1: assign the request id, resolve the client IP, stamp the start
/// time. An inbound X-Request-Id is honored; otherwise one is generated.
pub async fn request_meta(
    State(ctx): State<Arc<AppContext>>,
    mut req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(|v| v.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    let client_ip = extract_client_ip(req.headers(), peer, ctx.config.ip.trust_proxy_headers);

    req.extensions_mut().insert(RequestMeta {
        request_id,
        client_ip,
        start: Instant::now(),
    });

    next.run(req).await
}

/// Stage 2: request logging, wrapping everything downstream.
pub async fn request_logging(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let meta = req.extensions().get::<RequestMeta>().cloned();
    let (request_id, start) = match &meta {
        Some(meta) => (meta.request_id.clone(), meta.start),
        None => (String::new(), Instant::now()),
    };

    tracing::debug!(method = %method, path = %path, request_id = %request_id, "incoming request");

    let response = next.run(req).await;

    let status = response.status();
    let duration = start.elapsed();
    tracing::info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration_ms = duration.as_millis() as u64,
        request_id = %request_id,
        "request completed"
    );

    response
}

/// Stage 8: response transform. Strips hop-by-hop headers and adds the
/// gateway identification and security headers.
pub async fn response_transform(req: Request, next: Next) -> Response {
    let meta = req.extensions().get::<RequestMeta>().cloned();

    let mut response = next.run(req).await;

    let headers = response.headers_mut();
    let hop_by_hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .cloned()
        .collect();
    for name in hop_by_hop {
        headers.remove(&name);
    }

    add_security_headers(headers);
    headers.insert(
        HeaderName::from_static("x-gateway"),
        HeaderValue::from_static(concat!("portcullis/", env!("CARGO_PKG_VERSION"))),
    );

    if let Some(meta) = meta {
        if let Ok(value) = HeaderValue::from_str(&meta.request_id) {
            headers.insert(HeaderName::from_static("x-request-id"), value);
        }
        let elapsed_ms = meta.start.elapsed().as_millis() as u64;
        headers.insert(
            HeaderName::from_static("x-response-time"),
            HeaderValue::from(elapsed_ms),
        );
    }

    response
}

/// Stage 3: IP rules. Rejects blocked IPs before any credential is looked
/// at; an active block wins over valid credentials.
pub async fn ip_rules(
    State(ctx): State<Arc<AppContext>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(meta) = req.extensions().get::<RequestMeta>().cloned() else {
        return GatewayError::Internal("request metadata missing".into()).into_response();
    };

    if let Err(e) = ctx.ip_guard.ensure_allowed(&meta.client_ip).await {
        tracing::warn!(ip = %meta.client_ip, code = e.error_code(), "request rejected by ip rules");
        return e.into_response();
    }

    next.run(req).await
}
