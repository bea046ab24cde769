use anyhow::{Context, Result};

// ============================================================================
// Configuration Constants
// ============================================================================

const DEFAULT_PORT: u16 = 8080;

// Token lifetimes
const DEFAULT_ACCESS_TOKEN_TTL_SECS: i64 = 900; // 15 minutes
const DEFAULT_REFRESH_TOKEN_TTL_SECS: i64 = 30 * 86400; // 30 days

// Upstream forwarding
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;
const DEFAULT_UPSTREAM_MAX_RETRIES: u32 = 2;

// Circuit breaker
const DEFAULT_BREAKER_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_BREAKER_FAILURE_WINDOW_SECS: i64 = 60;
const DEFAULT_BREAKER_COOLDOWN_SECS: i64 = 30;

// Shared cache
const DEFAULT_CACHE_OP_TIMEOUT_SECS: u64 = 5;
const DEFAULT_ROUTE_CACHE_TTL_SECS: u64 = 300;

// Database pool
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 20;
const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 5;

// Time conversion constants
pub const SECONDS_PER_MINUTE: i64 = 60;
pub const SECONDS_PER_HOUR: i64 = 3600;
pub const SECONDS_PER_DAY: i64 = 86400;

// ============================================================================
// Configuration Structures
// ============================================================================

/// Token signing and lifetime configuration
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,
}

/// Database connection pool configuration
#[derive(Clone, Debug)]
pub struct DbConfig {
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

/// Outbound proxy configuration
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Per-attempt upstream timeout (seconds)
    pub upstream_timeout_secs: u64,
    /// Additional attempts after the first, on retryable 5xx
    pub max_retries: u32,
}

/// Circuit breaker configuration (applies per route)
#[derive(Clone, Debug)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    /// Rolling window within which failures accumulate (seconds)
    pub failure_window_secs: i64,
    /// How long an open circuit refuses requests before probing (seconds)
    pub cooldown_secs: i64,
}

/// Rate limiter configuration
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Behavior when the shared cache is unreachable and the policy does not
    /// say otherwise: "open" allows, "closed" rejects.
    pub default_fail_open: bool,
    /// Hard timeout for a single cache-side check (seconds)
    pub cache_op_timeout_secs: u64,
}

/// IP enforcement configuration
#[derive(Clone, Debug)]
pub struct IpConfig {
    /// Trust X-Forwarded-For / X-Real-Ip (gateway is behind a proxy)
    pub trust_proxy_headers: bool,
    /// When set, every client IP must carry an active allow rule
    pub allowlist_mode: bool,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub port: u16,
    pub auth: AuthConfig,
    pub db: DbConfig,
    pub proxy: ProxyConfig,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub ip: IpConfig,
    /// In-process route/policy cache TTL (seconds); staleness up to this is accepted
    pub route_cache_ttl_secs: u64,
    pub cors_allowed_origins: Vec<String>,
    /// Salt for log-safe identifier hashing
    pub log_hash_salt: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let jwt_secret = std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        if jwt_secret.len() < 32 {
            anyhow::bail!("JWT_SECRET must be at least 32 bytes");
        }

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            port: env_parse("PORT", DEFAULT_PORT),
            auth: AuthConfig {
                jwt_secret,
                jwt_issuer: std::env::var("JWT_ISSUER")
                    .unwrap_or_else(|_| "portcullis".to_string()),
                access_token_ttl_secs: env_parse(
                    "ACCESS_TOKEN_TTL_SECS",
                    DEFAULT_ACCESS_TOKEN_TTL_SECS,
                ),
                refresh_token_ttl_secs: env_parse(
                    "REFRESH_TOKEN_TTL_SECS",
                    DEFAULT_REFRESH_TOKEN_TTL_SECS,
                ),
            },
            db: DbConfig {
                max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
                acquire_timeout_secs: env_parse(
                    "DB_ACQUIRE_TIMEOUT_SECS",
                    DEFAULT_DB_ACQUIRE_TIMEOUT_SECS,
                ),
            },
            proxy: ProxyConfig {
                upstream_timeout_secs: env_parse(
                    "UPSTREAM_TIMEOUT_SECS",
                    DEFAULT_UPSTREAM_TIMEOUT_SECS,
                ),
                max_retries: env_parse("UPSTREAM_MAX_RETRIES", DEFAULT_UPSTREAM_MAX_RETRIES),
            },
            breaker: BreakerConfig {
                failure_threshold: env_parse(
                    "BREAKER_FAILURE_THRESHOLD",
                    DEFAULT_BREAKER_FAILURE_THRESHOLD,
                ),
                failure_window_secs: env_parse(
                    "BREAKER_FAILURE_WINDOW_SECS",
                    DEFAULT_BREAKER_FAILURE_WINDOW_SECS,
                ),
                cooldown_secs: env_parse("BREAKER_COOLDOWN_SECS", DEFAULT_BREAKER_COOLDOWN_SECS),
            },
            rate_limit: RateLimitConfig {
                default_fail_open: std::env::var("DEFAULT_FAILURE_MODE")
                    .map(|v| v.to_lowercase() != "closed")
                    .unwrap_or(true),
                cache_op_timeout_secs: env_parse(
                    "CACHE_OP_TIMEOUT_SECS",
                    DEFAULT_CACHE_OP_TIMEOUT_SECS,
                ),
            },
            ip: IpConfig {
                trust_proxy_headers: env_flag("TRUST_PROXY_HEADERS", true),
                allowlist_mode: env_flag("IP_ALLOWLIST_MODE", false),
            },
            route_cache_ttl_secs: env_parse("ROUTE_CACHE_TTL_SECS", DEFAULT_ROUTE_CACHE_TTL_SECS),
            cors_allowed_origins: std::env::var("CORS_ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            log_hash_salt: std::env::var("LOG_HASH_SALT").unwrap_or_else(|_| "portcullis".into()),
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}
