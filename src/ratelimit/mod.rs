//! Rate limiting.
//!
//! One of five strategies per policy, each executed as a single atomic
//! script on the shared cache (see [`scripts`]). Counters are keyed by
//! `(strategy, route, tier, identifier)`; the identifier is user id, then
//! API key id, then client IP.

pub mod scripts;

use crate::cache::SharedCache;
use crate::config::RateLimitConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::models::{ApiDefinition, RateLimitPolicy, Strategy, Tier};
use std::time::Duration;

/// Fallback retry hint for concurrency denials; release time is
/// unpredictable so there is nothing better to report.
const CONCURRENCY_RETRY_HINT_MS: u64 = 1000;

/// Leak-recovery TTL for concurrency counters. Must exceed the worst-case
/// retried upstream round-trip so live requests never lose their slot.
const CONCURRENCY_TTL_SECS: u64 = 120;

/// Idle TTL bounds for bucket state.
const BUCKET_TTL_MIN_SECS: u64 = 60;
const BUCKET_TTL_MAX_SECS: u64 = 86400;

/// A passed rate-limit check, carrying the response header values and, for
/// the concurrency strategy, the lease that must be released.
pub struct CheckOutcome {
    pub limit: u32,
    pub remaining: u32,
    pub reset_secs: u64,
    pub lease: Option<ConcurrencyLease>,
}

pub struct RateLimiter {
    cache: SharedCache,
    op_timeout: Duration,
    default_fail_open: bool,
}

impl RateLimiter {
    pub fn new(cache: SharedCache, config: &RateLimitConfig) -> Self {
        Self {
            cache,
            op_timeout: Duration::from_secs(config.cache_op_timeout_secs),
            default_fail_open: config.default_fail_open,
        }
    }

    /// Run the policy's strategy for one request.
    ///
    /// `Ok(None)` means the request proceeds without rate-limit headers
    /// (cache unavailable under a fail-open policy). A denial is returned as
    /// `GatewayError::RateLimitExceeded`; cache failure under fail-closed as
    /// `GatewayError::RateLimiterUnavailable`.
    pub async fn check(
        &self,
        policy: &RateLimitPolicy,
        route: &ApiDefinition,
        tier: Tier,
        identifier: &str,
    ) -> GatewayResult<Option<CheckOutcome>> {
        let key = counter_key(policy.strategy, route, tier, identifier);
        let capacity = policy.capacity as u32;

        let attempt = tokio::time::timeout(self.op_timeout, self.invoke(policy, &key)).await;

        let raw = match attempt {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return self.unavailable(policy, route, &e.to_string()),
            Err(_) => return self.unavailable(policy, route, "cache operation timed out"),
        };

        let (allowed, remaining, retry_after_ms, reset_ms) = raw;
        let remaining = remaining.max(0) as u32;
        let reset_secs = ((reset_ms.max(0) as u64) + 999) / 1000;

        if allowed == 0 {
            let retry_after_ms = if policy.strategy == Strategy::Concurrency {
                CONCURRENCY_RETRY_HINT_MS
            } else {
                retry_after_ms.max(0) as u64
            };
            return Err(GatewayError::RateLimitExceeded {
                strategy: policy.strategy.as_str(),
                limit: capacity,
                remaining,
                retry_after_ms,
                reset_secs,
            });
        }

        let lease = (policy.strategy == Strategy::Concurrency)
            .then(|| ConcurrencyLease::new(self.cache.clone(), key));

        Ok(Some(CheckOutcome {
            limit: capacity,
            remaining,
            reset_secs,
            lease,
        }))
    }

    async fn invoke(
        &self,
        policy: &RateLimitPolicy,
        key: &str,
    ) -> Result<(i64, i64, i64, i64), redis::RedisError> {
        let mut cache = self.cache.clone();
        let capacity = policy.capacity;
        let rate = policy.refill_rate.unwrap_or(0.0);
        let window = policy.window_seconds.unwrap_or(0);

        let script = match policy.strategy {
            Strategy::TokenBucket => {
                let script = redis::Script::new(scripts::TOKEN_BUCKET);
                return script
                    .key(key)
                    .arg(capacity)
                    .arg(rate)
                    .arg(bucket_ttl(capacity, rate))
                    .invoke_async(cache.connection_mut())
                    .await;
            }
            Strategy::LeakyBucket => {
                let script = redis::Script::new(scripts::LEAKY_BUCKET);
                return script
                    .key(key)
                    .arg(capacity)
                    .arg(rate)
                    .arg(bucket_ttl(capacity, rate))
                    .invoke_async(cache.connection_mut())
                    .await;
            }
            Strategy::FixedWindow => redis::Script::new(scripts::FIXED_WINDOW),
            Strategy::SlidingWindow => redis::Script::new(scripts::SLIDING_WINDOW),
            Strategy::Concurrency => {
                let script = redis::Script::new(scripts::CONCURRENCY_ACQUIRE);
                return script
                    .key(key)
                    .arg(capacity)
                    .arg(CONCURRENCY_TTL_SECS)
                    .invoke_async(cache.connection_mut())
                    .await;
            }
        };

        script
            .key(key)
            .arg(capacity)
            .arg(window)
            .invoke_async(cache.connection_mut())
            .await
    }

    fn unavailable(
        &self,
        policy: &RateLimitPolicy,
        route: &ApiDefinition,
        reason: &str,
    ) -> GatewayResult<Option<CheckOutcome>> {
        if policy.fails_open(self.default_fail_open) {
            tracing::warn!(
                route = %route.name,
                strategy = %policy.strategy,
                %reason,
                "rate limiter unavailable, failing open"
            );
            Ok(None)
        } else {
            tracing::error!(
                route = %route.name,
                strategy = %policy.strategy,
                %reason,
                "rate limiter unavailable, failing closed"
            );
            Err(GatewayError::RateLimiterUnavailable)
        }
    }
}

/// An admitted concurrency slot. Released exactly once: explicitly after the
/// proxied response completes, or from `Drop` if the request path unwinds
/// before that.
pub struct ConcurrencyLease {
    cache: SharedCache,
    key: String,
    released: bool,
}

impl ConcurrencyLease {
    fn new(cache: SharedCache, key: String) -> Self {
        Self {
            cache,
            key,
            released: false,
        }
    }

    pub async fn release(mut self) {
        self.released = true;
        release_slot(self.cache.clone(), self.key.clone()).await;
    }
}

impl Drop for ConcurrencyLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let cache = self.cache.clone();
        let key = std::mem::take(&mut self.key);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                release_slot(cache, key).await;
            });
        }
    }
}

async fn release_slot(mut cache: SharedCache, key: String) {
    let script = redis::Script::new(scripts::CONCURRENCY_RELEASE);
    let outcome: Result<i64, _> = script.key(&key).invoke_async(cache.connection_mut()).await;
    if let Err(e) = outcome {
        // The counter TTL recovers the slot eventually.
        tracing::warn!(key = %key, error = %e, "concurrency release failed");
    }
}

fn counter_key(strategy: Strategy, route: &ApiDefinition, tier: Tier, identifier: &str) -> String {
    format!(
        "ratelimit:{}:{}:{}:{}",
        strategy.as_str(),
        route.id,
        tier.as_str(),
        identifier
    )
}

/// Idle TTL for bucket state: twice the time to refill from empty, bounded.
fn bucket_ttl(capacity: i32, rate: f64) -> u64 {
    if rate > 0.0 {
        let to_full = (capacity as f64 / rate).ceil() as u64;
        (to_full * 2).clamp(BUCKET_TTL_MIN_SECS, BUCKET_TTL_MAX_SECS)
    } else {
        3600
    }
}
