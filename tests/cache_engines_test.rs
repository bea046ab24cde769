// ============================================================================
// Shared-cache engine tests
// ============================================================================
//
// Exercises the atomic cache-side engines against a live Redis:
// - rate-limit strategies (burst, refill, windows, concurrency release)
// - circuit breaker transitions (trip, probe, recover)
// - refresh-rotation compare-and-set
//
// Run with: cargo test -- --ignored   (requires Redis at REDIS_URL)
//
// ============================================================================

use chrono::Utc;
use portcullis::breaker::{CircuitBreaker, CircuitDecision};
use portcullis::cache::SharedCache;
use portcullis::config::{BreakerConfig, RateLimitConfig};
use portcullis::error::GatewayError;
use portcullis::models::{ApiDefinition, RateLimitPolicy, Strategy, Tier};
use portcullis::ratelimit::RateLimiter;
use serial_test::serial;
use std::time::Duration;
use uuid::Uuid;

async fn cache() -> SharedCache {
    let url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    SharedCache::connect(&url)
        .await
        .expect("redis must be reachable for ignored tests")
}

fn limiter(cache: SharedCache) -> RateLimiter {
    RateLimiter::new(
        cache,
        &RateLimitConfig {
            default_fail_open: true,
            cache_op_timeout_secs: 5,
        },
    )
}

fn test_route(name: &str) -> ApiDefinition {
    ApiDefinition {
        id: Uuid::new_v4(),
        name: name.to_string(),
        route_pattern: "/orders/*".into(),
        backend_url: "http://127.0.0.1:9".into(),
        allowed_methods: vec!["GET".into()],
        enabled: true,
        created_at: Utc::now(),
    }
}

fn policy(strategy: Strategy, capacity: i32, refill_rate: f64, window: i32) -> RateLimitPolicy {
    RateLimitPolicy {
        id: Uuid::new_v4(),
        api_definition_id: Uuid::new_v4(),
        tier: None,
        strategy,
        capacity,
        refill_rate: Some(refill_rate),
        window_seconds: Some(window),
        failure_mode: Some("open".into()),
    }
}

#[tokio::test]
#[ignore = "requires Redis at REDIS_URL"]
#[serial]
async fn token_bucket_allows_burst_then_denies() {
    let limiter = limiter(cache().await);
    let route = test_route("tb-burst");
    // Paused refill: the bucket never recovers within the test.
    let policy = policy(Strategy::TokenBucket, 3, 0.0, 0);

    for i in 0..3 {
        let outcome = limiter
            .check(&policy, &route, Tier::Free, "user-1")
            .await
            .unwrap_or_else(|e| panic!("request {i} should be allowed: {e}"));
        assert!(outcome.is_some());
    }

    match limiter.check(&policy, &route, Tier::Free, "user-1").await {
        Err(GatewayError::RateLimitExceeded {
            remaining,
            retry_after_ms,
            ..
        }) => {
            assert_eq!(remaining, 0);
            assert!(retry_after_ms > 0);
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("fourth request should be denied"),
    }
}

#[tokio::test]
#[ignore = "requires Redis at REDIS_URL"]
#[serial]
async fn token_bucket_refills_over_time() {
    let limiter = limiter(cache().await);
    let route = test_route("tb-refill");
    let policy = policy(Strategy::TokenBucket, 1, 20.0, 0);

    assert!(limiter
        .check(&policy, &route, Tier::Free, "user-1")
        .await
        .unwrap()
        .is_some());
    assert!(limiter
        .check(&policy, &route, Tier::Free, "user-1")
        .await
        .is_err());

    // 20 tokens/sec: one token back within 100ms.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(limiter
        .check(&policy, &route, Tier::Free, "user-1")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
#[ignore = "requires Redis at REDIS_URL"]
#[serial]
async fn leaky_bucket_smooths_to_the_leak_rate() {
    let limiter = limiter(cache().await);
    let route = test_route("lb");
    let policy = policy(Strategy::LeakyBucket, 2, 10.0, 0);

    for _ in 0..2 {
        assert!(limiter
            .check(&policy, &route, Tier::Free, "user-1")
            .await
            .unwrap()
            .is_some());
    }
    // Queue is full; the burst is not admitted the way a token bucket would.
    assert!(limiter
        .check(&policy, &route, Tier::Free, "user-1")
        .await
        .is_err());

    // 10/sec leak: one slot opens within 100ms.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(limiter
        .check(&policy, &route, Tier::Free, "user-1")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
#[ignore = "requires Redis at REDIS_URL"]
#[serial]
async fn fixed_window_denies_at_capacity() {
    let limiter = limiter(cache().await);
    let route = test_route("fw");
    let policy = policy(Strategy::FixedWindow, 2, 0.0, 60);

    for _ in 0..2 {
        assert!(limiter
            .check(&policy, &route, Tier::Free, "user-1")
            .await
            .unwrap()
            .is_some());
    }

    match limiter.check(&policy, &route, Tier::Free, "user-1").await {
        Err(GatewayError::RateLimitExceeded {
            retry_after_ms,
            reset_secs,
            ..
        }) => {
            assert!(retry_after_ms <= 60_000);
            assert!(reset_secs <= 60);
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("third request should be denied"),
    }
}

#[tokio::test]
#[ignore = "requires Redis at REDIS_URL"]
#[serial]
async fn sliding_window_decrements_remaining() {
    let limiter = limiter(cache().await);
    let route = test_route("sw");
    let policy = policy(Strategy::SlidingWindow, 100, 0.0, 60);

    let first = limiter
        .check(&policy, &route, Tier::Free, "user-1")
        .await
        .unwrap()
        .unwrap();
    let second = limiter
        .check(&policy, &route, Tier::Free, "user-1")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first.limit, 100);
    assert!(second.remaining < first.remaining);
}

#[tokio::test]
#[ignore = "requires Redis at REDIS_URL"]
#[serial]
async fn concurrency_counter_returns_to_baseline() {
    let shared = cache().await;
    let limiter = limiter(shared.clone());
    let route = test_route("conc");
    let policy = policy(Strategy::Concurrency, 1, 0.0, 0);

    let outcome = limiter
        .check(&policy, &route, Tier::Free, "user-1")
        .await
        .unwrap()
        .expect("first acquire should be admitted");

    // Slot is held: a second caller is denied immediately.
    match limiter.check(&policy, &route, Tier::Free, "user-1").await {
        Err(GatewayError::RateLimitExceeded { retry_after_ms, .. }) => {
            assert!(retry_after_ms > 0)
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("second caller should be denied while the slot is held"),
    }

    outcome.lease.expect("concurrency check carries a lease").release().await;

    // Counter is back to its pre-test value; a new request is admitted.
    let key = format!(
        "ratelimit:concurrency:{}:free:user-1",
        route.id
    );
    let count: Option<i64> = shared.clone().get(&key).await.unwrap();
    assert_eq!(count.unwrap_or(0), 0);

    assert!(limiter
        .check(&policy, &route, Tier::Free, "user-1")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
#[ignore = "requires Redis at REDIS_URL"]
#[serial]
async fn breaker_trips_probes_and_recovers() {
    let shared = cache().await;
    let breaker = CircuitBreaker::new(
        shared,
        &BreakerConfig {
            failure_threshold: 2,
            failure_window_secs: 60,
            cooldown_secs: 1,
        },
    );
    let route = format!("breaker-{}", Uuid::new_v4());

    assert_eq!(breaker.preflight(&route).await.unwrap(), CircuitDecision::Closed);

    breaker.record_failure(&route).await;
    breaker.record_failure(&route).await;

    // Threshold met: requests fail fast without touching the backend.
    assert!(matches!(
        breaker.preflight(&route).await,
        Err(GatewayError::CircuitOpen { .. })
    ));

    // After the cooldown exactly one caller becomes the probe.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(breaker.preflight(&route).await.unwrap(), CircuitDecision::Probe);
    assert!(matches!(
        breaker.preflight(&route).await,
        Err(GatewayError::CircuitOpen { .. })
    ));

    breaker.record_success(&route).await;
    assert_eq!(breaker.preflight(&route).await.unwrap(), CircuitDecision::Closed);
}

#[tokio::test]
#[ignore = "requires Redis at REDIS_URL"]
#[serial]
async fn breaker_reopens_on_failed_probe() {
    let shared = cache().await;
    let breaker = CircuitBreaker::new(
        shared,
        &BreakerConfig {
            failure_threshold: 1,
            failure_window_secs: 60,
            cooldown_secs: 1,
        },
    );
    let route = format!("breaker-{}", Uuid::new_v4());

    breaker.record_failure(&route).await;
    assert!(breaker.preflight(&route).await.is_err());

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(breaker.preflight(&route).await.unwrap(), CircuitDecision::Probe);

    // Probe fails: straight back to open, new cooldown.
    breaker.record_failure(&route).await;
    assert!(matches!(
        breaker.preflight(&route).await,
        Err(GatewayError::CircuitOpen { .. })
    ));
}

#[tokio::test]
#[ignore = "requires Redis at REDIS_URL"]
#[serial]
async fn refresh_rotation_cas_has_one_winner() {
    let mut cache = cache().await;
    let key = format!("blacklist:{}", Uuid::new_v4());

    let first = cache.set_nx_ex(&key, "rotated", 30).await.unwrap();
    let second = cache.set_nx_ex(&key, "rotated", 30).await.unwrap();

    assert!(first, "first rotation attempt wins");
    assert!(!second, "second rotation attempt loses the compare-and-set");

    cache.del(&[key]).await.unwrap();
}
