//! Proxy entry: the fallback handler for every consumer-facing path.
//!
//! Runs the inner pipeline stages in order (authenticate, resolve route,
//! rate limit, breaker pre-flight, forward) and owns the concurrency lease
//! discipline: one release per acquire, on every exit path.

use crate::autoblock::ViolationKind;
use crate::context::AppContext;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics;
use crate::proxy::{ForwardRequest, ForwardedIdentity};
use crate::ratelimit::CheckOutcome;
use crate::routes::extractors::authenticate;
use crate::routes::middleware::RequestMeta;
use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::time::Instant;

pub async fn proxy_entry(State(ctx): State<Arc<AppContext>>, req: Request) -> Response {
    let Some(meta) = req.extensions().get::<RequestMeta>().cloned() else {
        return GatewayError::Internal("request metadata missing".into()).into_response();
    };

    match handle(&ctx, &meta, req).await {
        Ok(response) => response,
        Err(e) => {
            metrics::observe_error(e.classification());
            e.into_response()
        }
    }
}

async fn handle(
    ctx: &Arc<AppContext>,
    meta: &RequestMeta,
    req: Request,
) -> GatewayResult<Response> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let path = uri.path().to_string();
    let headers = req.headers().clone();

    // Stage 4: authentication. Violations are recorded inside.
    let caller = authenticate(ctx, &headers, &meta.client_ip).await?;

    // Route resolution precedes the limiter: the policy is per route.
    let route = ctx.routes.resolve(method.as_str(), &path).await?;

    // Stage 5: rate limiting.
    let mut check = match ctx.routes.policy_for(route.id, caller.tier).await? {
        Some(policy) => {
            let identifier = caller.rate_limit_identifier();
            match ctx
                .limiter
                .check(&policy, &route, caller.tier, &identifier)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    if matches!(e, GatewayError::RateLimitExceeded { .. }) {
                        ctx.blocker
                            .record(ViolationKind::RateLimitAbuse, &meta.client_ip)
                            .await;
                    }
                    return Err(e);
                }
            }
        }
        None => None,
    };

    // Stage 7 pre-flight: an open circuit fails fast, no backend contact.
    let preflight = ctx.breaker.preflight(&route.name).await;
    if let Err(e) = preflight {
        release_lease(&mut check).await;
        return Err(e);
    }

    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http")
        .to_string();
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let body = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            release_lease(&mut check).await;
            return Err(GatewayError::Validation(format!("unreadable body: {}", e)));
        }
    };

    // Stage 6 + 7: timed forward through the breaker-guarded client.
    let started = Instant::now();
    let forwarded = ctx
        .proxy
        .forward(
            &ctx.breaker,
            &route,
            ForwardRequest {
                method: method.clone(),
                path: &path,
                query: uri.query(),
                headers: &headers,
                body,
                request_id: &meta.request_id,
                client_ip: &meta.client_ip,
                proto: &proto,
                host: host.as_deref(),
                identity: Some(ForwardedIdentity {
                    user_id: caller.user_id.to_string(),
                    tier: caller.tier.as_str(),
                }),
            },
        )
        .await;
    let latency = started.elapsed();

    // The lease is released on every path out of this function, success and
    // failure alike; the cache TTL only exists for crashed processes.
    release_lease(&mut check).await;

    let mut response = forwarded?;

    metrics::observe_request(
        &route.name,
        method.as_str(),
        response.status().as_u16(),
        latency.as_secs_f64(),
    );
    let stats_cache = ctx.cache.clone();
    let status = response.status().as_u16();
    tokio::spawn(metrics::bump_shared_stats(stats_cache, status));

    if let Some(check) = &check {
        let headers = response.headers_mut();
        headers.insert("x-ratelimit-limit", HeaderValue::from(check.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(check.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(check.reset_secs));
    }

    Ok(response)
}

async fn release_lease(check: &mut Option<CheckOutcome>) {
    if let Some(check) = check.as_mut() {
        if let Some(lease) = check.lease.take() {
            lease.release().await;
        }
    }
}

/// Reserved management namespaces (/admin, /developer). Their CRUD surfaces
/// are deployed separately; the gateway only keeps the paths from falling
/// through to the proxy.
pub async fn reserved_surface() -> Response {
    GatewayError::RouteNotFound.into_response()
}
