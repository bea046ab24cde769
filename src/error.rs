use axum::http::{header, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use serde_json::json;
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway error taxonomy.
///
/// Every error the gateway itself generates maps to a stable error code and
/// an HTTP status. Proxied backend responses never pass through this type;
/// they are returned byte-for-byte.
#[derive(Error, Debug)]
pub enum GatewayError {
    // ===== Authentication (401) =====
    #[error("no credentials supplied")]
    MissingCredentials,

    #[error("token is invalid: {0}")]
    InvalidToken(String),

    #[error("token has expired")]
    TokenExpired,

    #[error("token was revoked")]
    TokenRevoked,

    #[error("token version is stale")]
    TokenVersionMismatch,

    #[error("API key is invalid")]
    InvalidApiKey,

    #[error("API key has expired")]
    ApiKeyExpired,

    #[error("invalid email or password")]
    InvalidCredentials,

    // ===== Authorization (403) =====
    #[error("key is missing required scope {0}")]
    InsufficientScope(String),

    #[error("requests from this IP are blocked")]
    IpBlocked,

    #[error("this IP is not on the allow list")]
    IpNotAllowed,

    #[error("API is disabled")]
    ApiDisabled,

    // ===== Routing (404) =====
    #[error("no route matches this request")]
    RouteNotFound,

    // ===== Rate limiting (429 / 503) =====
    #[error("rate limit exceeded ({strategy})")]
    RateLimitExceeded {
        strategy: &'static str,
        limit: u32,
        remaining: u32,
        retry_after_ms: u64,
        reset_secs: u64,
    },

    #[error("rate limiter is unavailable")]
    RateLimiterUnavailable,

    // ===== Upstream (502 / 504) =====
    #[error("circuit breaker is open for route {route}")]
    CircuitOpen { route: String },

    #[error("upstream request failed: {0}")]
    UpstreamError(String),

    #[error("upstream request timed out")]
    UpstreamTimeout,

    // ===== Request validation (400) =====
    #[error("validation error: {0}")]
    Validation(String),

    // ===== Infrastructure (500) =====
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        use GatewayError::*;
        match self {
            MissingCredentials | InvalidToken(_) | TokenExpired | TokenRevoked
            | TokenVersionMismatch | InvalidApiKey | ApiKeyExpired | InvalidCredentials => {
                StatusCode::UNAUTHORIZED
            }
            InsufficientScope(_) | IpBlocked | IpNotAllowed | ApiDisabled => StatusCode::FORBIDDEN,
            RouteNotFound => StatusCode::NOT_FOUND,
            RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            RateLimiterUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            CircuitOpen { .. } | UpstreamError(_) => StatusCode::BAD_GATEWAY,
            UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Validation(_) => StatusCode::BAD_REQUEST,
            Database(_) | Cache(_) | Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        use GatewayError::*;
        match self {
            MissingCredentials => "MISSING_CREDENTIALS",
            InvalidToken(_) => "INVALID_TOKEN",
            TokenExpired => "TOKEN_EXPIRED",
            TokenRevoked => "TOKEN_REVOKED",
            TokenVersionMismatch => "TOKEN_VERSION_MISMATCH",
            InvalidApiKey => "INVALID_API_KEY",
            ApiKeyExpired => "API_KEY_EXPIRED",
            InvalidCredentials => "INVALID_CREDENTIALS",
            InsufficientScope(_) => "INSUFFICIENT_SCOPE",
            IpBlocked => "IP_BLOCKED",
            IpNotAllowed => "IP_NOT_ALLOWED",
            ApiDisabled => "API_DISABLED",
            RouteNotFound => "ROUTE_NOT_FOUND",
            RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            RateLimiterUnavailable => "RATE_LIMITER_ERROR",
            CircuitOpen { .. } => "UPSTREAM_ERROR",
            UpstreamError(_) => "UPSTREAM_ERROR",
            UpstreamTimeout => "UPSTREAM_TIMEOUT",
            Validation(_) => "VALIDATION_ERROR",
            Database(_) | Cache(_) | Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// User-facing message. Infrastructure details never leave the process.
    pub fn user_message(&self) -> String {
        use GatewayError::*;
        match self {
            Database(_) | Cache(_) | Internal(_) => "Internal server error".to_string(),
            CircuitOpen { route } => {
                format!("Upstream for route '{}' is unavailable (circuit open)", route)
            }
            other => other.to_string(),
        }
    }

    /// Metrics classification bucket for this error.
    pub fn classification(&self) -> &'static str {
        use GatewayError::*;
        match self {
            Validation(_) => "validation",
            MissingCredentials | InvalidToken(_) | TokenExpired | TokenRevoked
            | TokenVersionMismatch | InvalidApiKey | ApiKeyExpired | InvalidCredentials => {
                "authentication"
            }
            InsufficientScope(_) | IpBlocked | IpNotAllowed | ApiDisabled => "authorization",
            RouteNotFound => "not_found",
            RateLimitExceeded { .. } | RateLimiterUnavailable => "rate_limit",
            CircuitOpen { .. } | UpstreamError(_) | UpstreamTimeout | Database(_) | Cache(_)
            | Internal(_) => "server",
        }
    }

    /// Log with a level matching the error class.
    pub fn log(&self) {
        let status = self.status_code();
        let code = self.error_code();

        if status.is_server_error() {
            tracing::error!(error = %self, error_code = %code, status = %status.as_u16(), "gateway error");
        } else if status == StatusCode::UNAUTHORIZED {
            tracing::warn!(error = %self, error_code = %code, "authentication rejected");
        } else {
            tracing::debug!(error = %self, error_code = %code, "request rejected");
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        self.log();

        let status = self.status_code();
        let details = match &self {
            GatewayError::RateLimitExceeded {
                strategy,
                limit,
                remaining,
                retry_after_ms,
                ..
            } => Some(json!({
                "strategy": strategy,
                "limit": limit,
                "remaining": remaining,
                "retry_after_ms": retry_after_ms,
            })),
            GatewayError::InsufficientScope(scope) => Some(json!({ "required_scope": scope })),
            _ => None,
        };

        let mut error_body = json!({
            "code": self.error_code(),
            "message": self.user_message(),
        });
        if let Some(details) = details {
            error_body["details"] = details;
        }

        let body = json!({ "success": false, "error": error_body });
        let mut response = (status, axum::Json(body)).into_response();

        if let GatewayError::RateLimitExceeded {
            limit,
            remaining,
            retry_after_ms,
            reset_secs,
            ..
        } = self
        {
            let headers = response.headers_mut();
            let retry_secs = retry_after_ms.div_ceil(1000);
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_secs));
            headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
            headers.insert("x-ratelimit-reset", HeaderValue::from(reset_secs));
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_map_to_401() {
        for e in [
            GatewayError::MissingCredentials,
            GatewayError::InvalidToken("bad signature".into()),
            GatewayError::TokenExpired,
            GatewayError::TokenRevoked,
            GatewayError::TokenVersionMismatch,
            GatewayError::InvalidApiKey,
            GatewayError::ApiKeyExpired,
        ] {
            assert_eq!(e.status_code(), StatusCode::UNAUTHORIZED);
            assert_eq!(e.classification(), "authentication");
        }
    }

    #[test]
    fn distinct_codes_for_token_failures() {
        assert_eq!(GatewayError::TokenExpired.error_code(), "TOKEN_EXPIRED");
        assert_eq!(GatewayError::TokenRevoked.error_code(), "TOKEN_REVOKED");
        assert_eq!(
            GatewayError::TokenVersionMismatch.error_code(),
            "TOKEN_VERSION_MISMATCH"
        );
        assert_eq!(
            GatewayError::InvalidToken("x".into()).error_code(),
            "INVALID_TOKEN"
        );
    }

    #[test]
    fn infrastructure_errors_are_redacted() {
        let e = GatewayError::Internal("pool exhausted at 10.0.0.3:5432".into());
        assert_eq!(e.user_message(), "Internal server error");
        assert_eq!(e.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn rate_limit_statuses() {
        let deny = GatewayError::RateLimitExceeded {
            strategy: "token_bucket",
            limit: 10,
            remaining: 0,
            retry_after_ms: 1500,
            reset_secs: 2,
        };
        assert_eq!(deny.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            GatewayError::RateLimiterUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::RateLimiterUnavailable.error_code(),
            "RATE_LIMITER_ERROR"
        );
    }

    #[tokio::test]
    async fn envelope_shape_and_rate_limit_headers() {
        let deny = GatewayError::RateLimitExceeded {
            strategy: "sliding_window",
            limit: 100,
            remaining: 0,
            retry_after_ms: 1200,
            reset_secs: 42,
        };
        let response = deny.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "2");
        assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "100");
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(response.headers().get("x-ratelimit-reset").unwrap(), "42");

        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["success"], false);
        assert_eq!(parsed["error"]["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(parsed["error"]["details"]["strategy"], "sliding_window");
        assert!(parsed["error"]["message"].is_string());
    }

    #[test]
    fn upstream_errors_map_to_gateway_statuses() {
        assert_eq!(
            GatewayError::UpstreamError("connect refused".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::UpstreamTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        let open = GatewayError::CircuitOpen {
            route: "orders".into(),
        };
        assert_eq!(open.status_code(), StatusCode::BAD_GATEWAY);
        assert!(open.user_message().contains("circuit open"));
    }
}
