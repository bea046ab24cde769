//! Stage-3 IP enforcement.
//!
//! `blocked_ip:<ip>` in the shared cache is the fast path; the ip_rules
//! table is the source of truth. Enforcement fails open on infrastructure
//! trouble; an unreachable cache or database must not take every client
//! down with it.

use crate::cache::SharedCache;
use crate::db::DbPool;
use crate::error::{GatewayError, GatewayResult};
use crate::models::RuleType;
use crate::store::ip_rules;
use crate::utils::is_loopback;
use chrono::Utc;

/// How long a database verdict is held in the fast path before re-checking.
const BLOCK_CACHE_SECS: u64 = 60;

pub struct IpGuard {
    cache: SharedCache,
    db: DbPool,
    allowlist_mode: bool,
}

impl IpGuard {
    pub fn new(cache: SharedCache, db: DbPool, allowlist_mode: bool) -> Self {
        Self {
            cache,
            db,
            allowlist_mode,
        }
    }

    /// Reject when an active block rule covers the IP, or (in allowlist
    /// mode) when no active allow rule does. Loopback is always exempt.
    pub async fn ensure_allowed(&self, ip: &str) -> GatewayResult<()> {
        if is_loopback(ip) {
            return Ok(());
        }

        let mut cache = self.cache.clone();
        match cache.get::<String>(&blocked_ip_key(ip)).await {
            Ok(Some(_)) => return Err(GatewayError::IpBlocked),
            Ok(None) => {}
            Err(e) => tracing::warn!(%ip, error = %e, "blocked-ip fast path unavailable"),
        }

        let rules = match ip_rules::active_rules_for(&self.db, ip).await {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!(%ip, error = %e, "ip rule lookup failed, allowing");
                return Ok(());
            }
        };

        let now = Utc::now();
        if let Some(block) = rules
            .iter()
            .find(|r| r.rule_type == RuleType::Block && r.is_active(now))
        {
            let remaining = block
                .expires_at
                .map(|t| (t - now).num_seconds().max(1) as u64)
                .unwrap_or(BLOCK_CACHE_SECS);
            let ttl = remaining.min(BLOCK_CACHE_SECS);
            if let Err(e) = cache.set_ex(&blocked_ip_key(ip), "db", ttl).await {
                tracing::debug!(%ip, error = %e, "blocked-ip fast path not primed");
            }
            return Err(GatewayError::IpBlocked);
        }

        if self.allowlist_mode {
            let allowed = rules
                .iter()
                .any(|r| r.rule_type == RuleType::Allow && r.is_active(now));
            if !allowed {
                return Err(GatewayError::IpNotAllowed);
            }
        }

        Ok(())
    }

    /// Lift a block: expire the IP's active block rules and drop the fast
    /// path entry. This is the operation the management surface calls for a
    /// manual unblock; without the cache delete the fast path would keep
    /// rejecting until its TTL lapsed.
    pub async fn lift_block(&self, ip: &str) -> GatewayResult<u64> {
        let updated = sqlx::query(
            r#"
            UPDATE ip_rules
            SET expires_at = now()
            WHERE ip_address = $1
              AND rule_type = 'block'
              AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(ip)
        .execute(&self.db)
        .await?
        .rows_affected();

        let mut cache = self.cache.clone();
        cache.del(&[blocked_ip_key(ip)]).await?;

        tracing::info!(%ip, rules_expired = updated, "ip block lifted");
        Ok(updated)
    }
}

pub fn blocked_ip_key(ip: &str) -> String {
    format!("blocked_ip:{}", ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_ip_keyspace() {
        assert_eq!(blocked_ip_key("203.0.113.7"), "blocked_ip:203.0.113.7");
    }
}
