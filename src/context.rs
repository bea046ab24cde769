use crate::audit::AuditLogger;
use crate::auth::AuthManager;
use crate::autoblock::AutoBlocker;
use crate::breaker::CircuitBreaker;
use crate::cache::SharedCache;
use crate::config::Config;
use crate::db::DbPool;
use crate::ipguard::IpGuard;
use crate::proxy::UpstreamClient;
use crate::ratelimit::RateLimiter;
use crate::store::routes::RouteTable;
use std::sync::Arc;
use std::time::Duration;

/// Shared application state; one per process, handed around as `Arc`.
pub struct AppContext {
    pub config: Config,
    pub db: DbPool,
    pub cache: SharedCache,
    pub auth: AuthManager,
    pub routes: RouteTable,
    pub limiter: RateLimiter,
    pub breaker: CircuitBreaker,
    pub proxy: UpstreamClient,
    pub ip_guard: IpGuard,
    pub blocker: AutoBlocker,
    pub audit: Arc<AuditLogger>,
}

impl AppContext {
    pub fn new(config: Config, db: DbPool, cache: SharedCache) -> Self {
        let audit = Arc::new(AuditLogger::new(db.clone()));
        Self {
            auth: AuthManager::new(&config.auth),
            routes: RouteTable::new(db.clone(), Duration::from_secs(config.route_cache_ttl_secs)),
            limiter: RateLimiter::new(cache.clone(), &config.rate_limit),
            breaker: CircuitBreaker::new(cache.clone(), &config.breaker),
            proxy: UpstreamClient::new(&config.proxy),
            ip_guard: IpGuard::new(cache.clone(), db.clone(), config.ip.allowlist_mode),
            blocker: AutoBlocker::new(cache.clone(), db.clone(), audit.clone()),
            audit,
            config,
            db,
            cache,
        }
    }
}
