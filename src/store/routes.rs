use crate::db::DbPool;
use crate::error::{GatewayError, GatewayResult};
use crate::models::{ApiDefinition, RateLimitPolicy, Tier};
use crate::routing::pattern_matches;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Route and policy table with an in-process TTL cache.
///
/// Every gateway instance refreshes independently; a config change is not
/// guaranteed visible until the TTL lapses.
pub struct RouteTable {
    db: DbPool,
    ttl: Duration,
    state: RwLock<Option<Snapshot>>,
}

#[derive(Clone)]
struct Snapshot {
    routes: Arc<Vec<ApiDefinition>>,
    policies: Arc<HashMap<Uuid, Vec<RateLimitPolicy>>>,
    fetched_at: Instant,
}

impl RouteTable {
    pub fn new(db: DbPool, ttl: Duration) -> Self {
        Self {
            db,
            ttl,
            state: RwLock::new(None),
        }
    }

    /// Resolve a (method, path) pair to a route definition.
    pub async fn resolve(&self, method: &str, path: &str) -> GatewayResult<Arc<ApiDefinition>> {
        let snapshot = self.snapshot().await?;
        select_route(&snapshot.routes, method, path).map(|r| Arc::new(r.clone()))
    }

    /// Select the policy for a route and caller tier: tier-specific first,
    /// then the tier-null default, else none (rate limiting skipped).
    pub async fn policy_for(
        &self,
        route_id: Uuid,
        tier: Tier,
    ) -> GatewayResult<Option<RateLimitPolicy>> {
        let snapshot = self.snapshot().await?;
        let Some(policies) = snapshot.policies.get(&route_id) else {
            return Ok(None);
        };
        let tier_name = tier.as_str();
        let chosen = policies
            .iter()
            .find(|p| p.tier.as_deref() == Some(tier_name))
            .or_else(|| policies.iter().find(|p| p.tier.is_none()));
        Ok(chosen.cloned())
    }

    async fn snapshot(&self) -> GatewayResult<Snapshot> {
        {
            let state = self.state.read().await;
            if let Some(snapshot) = state.as_ref() {
                if snapshot.fetched_at.elapsed() < self.ttl {
                    return Ok(snapshot.clone());
                }
            }
        }

        let mut state = self.state.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(snapshot) = state.as_ref() {
            if snapshot.fetched_at.elapsed() < self.ttl {
                return Ok(snapshot.clone());
            }
        }

        let snapshot = self.load().await?;
        *state = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn load(&self) -> GatewayResult<Snapshot> {
        let routes = sqlx::query_as::<_, ApiDefinition>(
            r#"
            SELECT id, name, route_pattern, backend_url, allowed_methods, enabled, created_at
            FROM api_definitions
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.db)
        .await?;

        let policy_rows = sqlx::query_as::<_, RateLimitPolicy>(
            r#"
            SELECT id, api_definition_id, tier, strategy, capacity, refill_rate,
                   window_seconds, failure_mode
            FROM rate_limit_policies
            "#,
        )
        .fetch_all(&self.db)
        .await?;

        let mut policies: HashMap<Uuid, Vec<RateLimitPolicy>> = HashMap::new();
        for policy in policy_rows {
            if let Err(reason) = policy.validate() {
                tracing::error!(policy_id = %policy.id, %reason, "skipping invalid rate limit policy");
                continue;
            }
            policies.entry(policy.api_definition_id).or_default().push(policy);
        }

        tracing::debug!(
            routes = routes.len(),
            policies = policies.len(),
            "route table refreshed"
        );

        Ok(Snapshot {
            routes: Arc::new(routes),
            policies: Arc::new(policies),
            fetched_at: Instant::now(),
        })
    }
}

/// First-registered enabled match wins. A path that only matches disabled
/// routes is `API_DISABLED`; a matched route that rejects the method is 404.
fn select_route<'a>(
    routes: &'a [ApiDefinition],
    method: &str,
    path: &str,
) -> GatewayResult<&'a ApiDefinition> {
    let mut disabled_match = false;

    for route in routes {
        if !pattern_matches(&route.route_pattern, path) {
            continue;
        }
        if !route.enabled {
            disabled_match = true;
            continue;
        }
        if !route.method_allowed(method) {
            return Err(GatewayError::RouteNotFound);
        }
        return Ok(route);
    }

    if disabled_match {
        Err(GatewayError::ApiDisabled)
    } else {
        Err(GatewayError::RouteNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn route(name: &str, pattern: &str, methods: &[&str], enabled: bool, order: i64) -> ApiDefinition {
        ApiDefinition {
            id: Uuid::new_v4(),
            name: name.into(),
            route_pattern: pattern.into(),
            backend_url: format!("http://backend-{name}:8080"),
            allowed_methods: methods.iter().map(|m| m.to_string()).collect(),
            enabled,
            created_at: Utc.timestamp_opt(1_700_000_000 + order, 0).unwrap(),
        }
    }

    #[test]
    fn first_registered_enabled_route_wins() {
        let routes = vec![
            route("orders-v1", "/orders/*", &["GET"], true, 0),
            route("orders-v2", "/orders/*", &["GET"], true, 1),
        ];
        let chosen = select_route(&routes, "GET", "/orders/42").unwrap();
        assert_eq!(chosen.name, "orders-v1");
    }

    #[test]
    fn disabled_route_is_skipped_in_favor_of_enabled() {
        let routes = vec![
            route("old", "/orders/*", &["GET"], false, 0),
            route("new", "/orders/*", &["GET"], true, 1),
        ];
        assert_eq!(select_route(&routes, "GET", "/orders/1").unwrap().name, "new");
    }

    #[test]
    fn only_disabled_match_is_api_disabled() {
        let routes = vec![route("old", "/orders/*", &["GET"], false, 0)];
        match select_route(&routes, "GET", "/orders/1") {
            Err(GatewayError::ApiDisabled) => {}
            other => panic!("expected ApiDisabled, got {other:?}"),
        }
    }

    #[test]
    fn method_mismatch_is_not_found() {
        let routes = vec![route("orders", "/orders/*", &["GET", "POST"], true, 0)];
        match select_route(&routes, "DELETE", "/orders/1") {
            Err(GatewayError::RouteNotFound) => {}
            other => panic!("expected RouteNotFound, got {other:?}"),
        }
        assert!(select_route(&routes, "post", "/orders/1").is_ok());
    }

    #[test]
    fn no_match_is_not_found() {
        let routes = vec![route("orders", "/orders/*", &["GET"], true, 0)];
        match select_route(&routes, "GET", "/invoices/1") {
            Err(GatewayError::RouteNotFound) => {}
            other => panic!("expected RouteNotFound, got {other:?}"),
        }
    }
}
