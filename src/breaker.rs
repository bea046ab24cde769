//! Per-route circuit breaker.
//!
//! State lives in the shared cache so every gateway instance observes the
//! same circuit: `circuit:<route>:{state,failures,opened_at}`. Transitions
//! run as atomic scripts; in particular the open → half_open transition is a
//! compare-and-set, so exactly one request becomes the probe while the rest
//! keep failing fast.
//!
//! Failures counted: connection errors, timeouts, upstream 5xx. A 4xx is the
//! backend's business logic, not a failure.

use crate::cache::SharedCache;
use crate::config::BreakerConfig;
use crate::error::GatewayError;

/// Outcome of the pre-flight circuit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitDecision {
    /// Circuit closed, proceed normally.
    Closed,
    /// Circuit was open and the cooldown elapsed; this request is the probe.
    Probe,
}

/// KEYS: state, opened_at; ARGV: cooldown_secs, state_ttl_secs.
/// Returns 1 (closed), 2 (probe), 0 (reject).
const CHECK: &str = r#"
local state = redis.call('GET', KEYS[1])
if not state or state == 'closed' then
    return 1
end
local t = redis.call('TIME')
local now = tonumber(t[1])
if state == 'open' then
    local opened = tonumber(redis.call('GET', KEYS[2]) or '0')
    if now >= opened + tonumber(ARGV[1]) then
        redis.call('SET', KEYS[1], 'half_open', 'EX', ARGV[2])
        return 2
    end
    return 0
end
-- half_open: a probe is already in flight
return 0
"#;

/// KEYS: state, failures, opened_at; ARGV: state_ttl_secs.
const RECORD_SUCCESS: &str = r#"
local state = redis.call('GET', KEYS[1])
if state == 'half_open' then
    redis.call('SET', KEYS[1], 'closed', 'EX', ARGV[1])
    redis.call('DEL', KEYS[2], KEYS[3])
    return 'closed'
end
redis.call('DEL', KEYS[2])
return state or 'closed'
"#;

/// KEYS: state, failures, opened_at;
/// ARGV: threshold, failure_window_secs, state_ttl_secs.
const RECORD_FAILURE: &str = r#"
local state = redis.call('GET', KEYS[1])
local t = redis.call('TIME')
local now = tonumber(t[1])
if state == 'half_open' then
    redis.call('SET', KEYS[1], 'open', 'EX', ARGV[3])
    redis.call('SET', KEYS[3], now, 'EX', ARGV[3])
    redis.call('DEL', KEYS[2])
    return 'open'
end
if state == 'open' then
    return 'open'
end
local failures = redis.call('INCR', KEYS[2])
if failures == 1 then
    redis.call('EXPIRE', KEYS[2], ARGV[2])
end
if failures >= tonumber(ARGV[1]) then
    redis.call('SET', KEYS[1], 'open', 'EX', ARGV[3])
    redis.call('SET', KEYS[3], now, 'EX', ARGV[3])
    redis.call('DEL', KEYS[2])
    return 'open'
end
return 'closed'
"#;

pub struct CircuitBreaker {
    cache: SharedCache,
    failure_threshold: u32,
    failure_window_secs: i64,
    cooldown_secs: i64,
    state_ttl_secs: i64,
}

impl CircuitBreaker {
    pub fn new(cache: SharedCache, config: &BreakerConfig) -> Self {
        Self {
            cache,
            failure_threshold: config.failure_threshold,
            failure_window_secs: config.failure_window_secs,
            cooldown_secs: config.cooldown_secs,
            // State must outlive the cooldown or an open circuit would
            // silently close on expiry.
            state_ttl_secs: (config.cooldown_secs * 4).max(300),
        }
    }

    /// Consult the circuit before contacting the backend. An open circuit
    /// rejects without touching the upstream. Cache trouble fails open: a
    /// broken breaker must not take down healthy routes.
    pub async fn preflight(&self, route_name: &str) -> Result<CircuitDecision, GatewayError> {
        let mut cache = self.cache.clone();
        let script = redis::Script::new(CHECK);
        let verdict: Result<i64, _> = script
            .key(state_key(route_name))
            .key(opened_at_key(route_name))
            .arg(self.cooldown_secs)
            .arg(self.state_ttl_secs)
            .invoke_async(cache.connection_mut())
            .await;

        match verdict {
            Ok(1) => Ok(CircuitDecision::Closed),
            Ok(2) => {
                tracing::info!(route = %route_name, "circuit half-open, probing upstream");
                Ok(CircuitDecision::Probe)
            }
            Ok(_) => Err(GatewayError::CircuitOpen {
                route: route_name.to_string(),
            }),
            Err(e) => {
                tracing::warn!(route = %route_name, error = %e, "circuit check unavailable, allowing");
                Ok(CircuitDecision::Closed)
            }
        }
    }

    pub async fn record_success(&self, route_name: &str) {
        let mut cache = self.cache.clone();
        let script = redis::Script::new(RECORD_SUCCESS);
        let outcome: Result<String, _> = script
            .key(state_key(route_name))
            .key(failures_key(route_name))
            .key(opened_at_key(route_name))
            .arg(self.state_ttl_secs)
            .invoke_async(cache.connection_mut())
            .await;

        match outcome {
            Ok(state) if state == "closed" => {}
            Ok(state) => tracing::info!(route = %route_name, %state, "circuit state after success"),
            Err(e) => tracing::warn!(route = %route_name, error = %e, "circuit success not recorded"),
        }
    }

    pub async fn record_failure(&self, route_name: &str) {
        let mut cache = self.cache.clone();
        let script = redis::Script::new(RECORD_FAILURE);
        let outcome: Result<String, _> = script
            .key(state_key(route_name))
            .key(failures_key(route_name))
            .key(opened_at_key(route_name))
            .arg(self.failure_threshold)
            .arg(self.failure_window_secs)
            .arg(self.state_ttl_secs)
            .invoke_async(cache.connection_mut())
            .await;

        match outcome {
            Ok(state) if state == "open" => {
                tracing::warn!(route = %route_name, threshold = self.failure_threshold, "circuit open");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(route = %route_name, error = %e, "circuit failure not recorded"),
        }
    }
}

fn state_key(route: &str) -> String {
    format!("circuit:{}:state", route)
}

fn failures_key(route: &str) -> String {
    format!("circuit:{}:failures", route)
}

fn opened_at_key(route: &str) -> String {
    format!("circuit:{}:opened_at", route)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_the_circuit_prefix() {
        assert_eq!(state_key("orders"), "circuit:orders:state");
        assert_eq!(failures_key("orders"), "circuit:orders:failures");
        assert_eq!(opened_at_key("orders"), "circuit:orders:opened_at");
    }
}
