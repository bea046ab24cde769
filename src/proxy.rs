//! Upstream forwarding.
//!
//! One reqwest client serves every backend: pooled connections, keep-alive,
//! a per-attempt timeout. Retries apply to 502/503/504 only, with
//! exponential backoff; connect errors and timeouts are terminal. Each
//! failed attempt counts once toward the route's circuit breaker.

use crate::breaker::CircuitBreaker;
use crate::config::ProxyConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::models::ApiDefinition;
use crate::utils::is_hop_by_hop;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use std::time::Duration;

/// Request headers copied to the upstream verbatim.
const FORWARDED_REQUEST_HEADERS: &[&str] =
    &["content-type", "accept", "accept-language", "user-agent"];

const RETRYABLE_STATUSES: &[StatusCode] = &[
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Identity annotations forwarded to the backend for authenticated callers.
pub struct ForwardedIdentity {
    pub user_id: String,
    pub tier: &'static str,
}

pub struct ForwardRequest<'a> {
    pub method: Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub body: bytes::Bytes,
    pub request_id: &'a str,
    pub client_ip: &'a str,
    pub proto: &'a str,
    pub host: Option<&'a str>,
    pub identity: Option<ForwardedIdentity>,
}

pub struct UpstreamClient {
    client: reqwest::Client,
    max_retries: u32,
}

impl UpstreamClient {
    pub fn new(config: &ProxyConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.upstream_timeout_secs))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("failed to build upstream HTTP client");

        Self {
            client,
            max_retries: config.max_retries,
        }
    }

    /// Forward a request to the route's backend.
    ///
    /// The circuit breaker has already admitted this request; every failed
    /// attempt is reported back to it. Upstream responses, including 4xx
    /// and post-retry 5xx, pass through byte-for-byte.
    pub async fn forward(
        &self,
        breaker: &CircuitBreaker,
        route: &ApiDefinition,
        request: ForwardRequest<'_>,
    ) -> GatewayResult<Response> {
        let target_url = build_target_url(&route.backend_url, request.path, request.query);
        let upstream_headers = build_upstream_headers(&request);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let outcome = self
                .client
                .request(request.method.clone(), &target_url)
                .headers(upstream_headers.clone())
                .body(request.body.clone())
                .send()
                .await;

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() {
                        breaker.record_failure(&route.name).await;

                        if RETRYABLE_STATUSES.contains(&status) && attempt <= self.max_retries {
                            let delay = Duration::from_secs(1 << (attempt - 1));
                            tracing::debug!(
                                route = %route.name,
                                status = status.as_u16(),
                                attempt,
                                delay_secs = delay.as_secs(),
                                "retrying upstream request"
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    } else {
                        breaker.record_success(&route.name).await;
                    }

                    return into_response(response).await;
                }
                Err(e) => {
                    breaker.record_failure(&route.name).await;
                    tracing::warn!(
                        route = %route.name,
                        url = %target_url,
                        error = %e,
                        attempt,
                        "upstream request failed"
                    );
                    return Err(if e.is_timeout() {
                        GatewayError::UpstreamTimeout
                    } else {
                        GatewayError::UpstreamError(e.to_string())
                    });
                }
            }
        }
    }
}

fn build_target_url(backend_url: &str, path: &str, query: Option<&str>) -> String {
    let base = backend_url.trim_end_matches('/');
    match query {
        Some(query) => format!("{}{}?{}", base, path, query),
        None => format!("{}{}", base, path),
    }
}

fn build_upstream_headers(request: &ForwardRequest<'_>) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for name in FORWARDED_REQUEST_HEADERS {
        if let Some(value) = request.headers.get(*name) {
            if let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) {
                headers.insert(header_name, value.clone());
            }
        }
    }

    if let Ok(value) = HeaderValue::from_str(request.request_id) {
        headers.insert("x-request-id", value);
    }
    if let Ok(value) = HeaderValue::from_str(request.client_ip) {
        headers.insert("x-forwarded-for", value);
    }
    if let Ok(value) = HeaderValue::from_str(request.proto) {
        headers.insert("x-forwarded-proto", value);
    }
    if let Some(host) = request.host {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert("x-forwarded-host", value);
        }
    }
    if let Some(identity) = &request.identity {
        if let Ok(value) = HeaderValue::from_str(&identity.user_id) {
            headers.insert("x-user-id", value);
        }
        headers.insert("x-user-tier", HeaderValue::from_static(identity.tier));
    }

    headers
}

/// Convert the upstream response, stripping hop-by-hop headers.
async fn into_response(upstream: reqwest::Response) -> GatewayResult<Response> {
    let status = upstream.status();

    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name.as_str()) {
            headers.insert(name.clone(), value.clone());
        }
    }

    let body = upstream
        .bytes()
        .await
        .map_err(|e| GatewayError::UpstreamError(format!("reading upstream body: {}", e)))?;

    let mut response = Response::builder()
        .status(status)
        .body(Body::from(body))
        .map_err(|e| GatewayError::Internal(format!("assembling proxied response: {}", e)))?;
    *response.headers_mut() = headers;

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_url_preserves_path_and_query() {
        assert_eq!(
            build_target_url("http://orders:8080", "/orders/42", Some("full=1")),
            "http://orders:8080/orders/42?full=1"
        );
        assert_eq!(
            build_target_url("http://orders:8080/", "/orders", None),
            "http://orders:8080/orders"
        );
    }

    #[test]
    fn upstream_headers_are_whitelisted_and_annotated() {
        let mut incoming = HeaderMap::new();
        incoming.insert("content-type", HeaderValue::from_static("application/json"));
        incoming.insert("accept", HeaderValue::from_static("application/json"));
        incoming.insert("authorization", HeaderValue::from_static("Bearer secret"));
        incoming.insert("connection", HeaderValue::from_static("keep-alive"));
        incoming.insert("cookie", HeaderValue::from_static("session=1"));

        let request = ForwardRequest {
            method: Method::POST,
            path: "/orders",
            query: None,
            headers: &incoming,
            body: bytes::Bytes::new(),
            request_id: "req-1",
            client_ip: "203.0.113.7",
            proto: "https",
            host: Some("api.example.com"),
            identity: Some(ForwardedIdentity {
                user_id: "u-1".into(),
                tier: "pro",
            }),
        };

        let headers = build_upstream_headers(&request);
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert!(headers.get("authorization").is_none());
        assert!(headers.get("connection").is_none());
        assert!(headers.get("cookie").is_none());
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "203.0.113.7");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "api.example.com");
        assert_eq!(headers.get("x-user-id").unwrap(), "u-1");
        assert_eq!(headers.get("x-user-tier").unwrap(), "pro");
        assert_eq!(headers.get("x-request-id").unwrap(), "req-1");
    }

    #[test]
    fn retryable_statuses_are_the_gateway_5xx_family() {
        assert!(RETRYABLE_STATUSES.contains(&StatusCode::BAD_GATEWAY));
        assert!(RETRYABLE_STATUSES.contains(&StatusCode::SERVICE_UNAVAILABLE));
        assert!(RETRYABLE_STATUSES.contains(&StatusCode::GATEWAY_TIMEOUT));
        assert!(!RETRYABLE_STATUSES.contains(&StatusCode::INTERNAL_SERVER_ERROR));
    }
}
