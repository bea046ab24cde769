//! Auto-blocker: converts observed abuse into temporary IP block rules.
//!
//! Not a pipeline stage: the authentication and rate-limit stages call in
//! on each rejection. Violation counters live in the shared cache under
//! `violations:<kind>:<ip>`; the counter TTL is the observation window, set
//! only when the counter first becomes 1 so the window slides per burst.

use crate::audit::{AuditEvent, AuditEventType, AuditLogger};
use crate::cache::SharedCache;
use crate::db::DbPool;
use crate::ipguard::blocked_ip_key;
use crate::store::ip_rules;
use crate::utils::is_loopback;
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;

/// INCR with the observation window applied on first increment only.
const RECORD_VIOLATION: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    InvalidApiKey,
    InvalidToken,
    RateLimitAbuse,
    AuthFailure,
}

impl ViolationKind {
    pub const ALL: [ViolationKind; 4] = [
        Self::InvalidApiKey,
        Self::InvalidToken,
        Self::RateLimitAbuse,
        Self::AuthFailure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidApiKey => "invalid_api_key",
            Self::InvalidToken => "invalid_token",
            Self::RateLimitAbuse => "rate_limit_abuse",
            Self::AuthFailure => "auth_failure",
        }
    }

    /// Violations within the window that trigger a block.
    pub fn threshold(&self) -> i64 {
        match self {
            Self::InvalidApiKey => 10,
            Self::InvalidToken => 20,
            Self::RateLimitAbuse => 50,
            Self::AuthFailure => 30,
        }
    }

    /// Observation window in seconds.
    pub fn window_secs(&self) -> i64 {
        match self {
            Self::InvalidApiKey | Self::InvalidToken => 60,
            Self::RateLimitAbuse | Self::AuthFailure => 300,
        }
    }

    /// Block duration in seconds once the threshold is met.
    pub fn block_secs(&self) -> i64 {
        match self {
            Self::InvalidApiKey | Self::InvalidToken => 3600,
            Self::RateLimitAbuse => 1800,
            Self::AuthFailure => 7200,
        }
    }
}

#[derive(Clone)]
pub struct AutoBlocker {
    cache: SharedCache,
    db: DbPool,
    audit: Arc<AuditLogger>,
}

impl AutoBlocker {
    pub fn new(cache: SharedCache, db: DbPool, audit: Arc<AuditLogger>) -> Self {
        Self { cache, db, audit }
    }

    /// Record one violation; creates a block rule when the threshold is met.
    ///
    /// Errors are contained here; a broken blocker must not change request
    /// outcomes, which already carry their own rejection.
    pub async fn record(&self, kind: ViolationKind, ip: &str) {
        if is_loopback(ip) {
            return;
        }

        match self.is_whitelisted(ip).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(%ip, error = %e, "allow-rule lookup failed, counting violation");
            }
        }

        let key = violation_key(kind, ip);
        let mut cache = self.cache.clone();
        let script = redis::Script::new(RECORD_VIOLATION);
        let count: i64 = match script
            .key(&key)
            .arg(kind.window_secs())
            .invoke_async(cache.connection_mut())
            .await
        {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(%ip, kind = kind.as_str(), error = %e, "violation not recorded");
                return;
            }
        };

        tracing::debug!(%ip, kind = kind.as_str(), count, threshold = kind.threshold(), "violation recorded");

        if count >= kind.threshold() {
            self.block(kind, ip, count).await;
        }
    }

    async fn block(&self, kind: ViolationKind, ip: &str, count: i64) {
        let expires_at = Utc::now() + Duration::seconds(kind.block_secs());
        let reason = format!(
            "auto-blocked: {} x{} within {}s",
            kind.as_str(),
            count,
            kind.window_secs()
        );

        let rule = match ip_rules::insert_block(&self.db, ip, &reason, true, Some(expires_at)).await
        {
            Ok(rule) => rule,
            Err(e) => {
                tracing::error!(%ip, error = %e, "failed to persist auto-block rule");
                return;
            }
        };

        let mut cache = self.cache.clone();
        if let Err(e) = cache
            .set_ex(&blocked_ip_key(ip), "auto", kind.block_secs() as u64)
            .await
        {
            tracing::warn!(%ip, error = %e, "blocked-ip fast path not primed");
        }
        let _ = cache.del(&[violation_key(kind, ip)]).await;

        tracing::warn!(
            %ip,
            kind = kind.as_str(),
            count,
            block_secs = kind.block_secs(),
            rule_id = %rule.id,
            "IP auto-blocked"
        );

        self.audit
            .record_best_effort(
                AuditEvent::new(AuditEventType::IpAutoBlocked)
                    .ip(ip)
                    .resource("ip_rule", &rule.id.to_string())
                    .changes(json!({
                        "rule_type": "block",
                        "auto_blocked": true,
                        "expires_at": expires_at.to_rfc3339(),
                    }))
                    .metadata(json!({
                        "violation_kind": kind.as_str(),
                        "violation_count": count,
                    })),
            )
            .await;
    }

    /// Forget every violation for an IP. Called on successful authentication.
    pub async fn clear(&self, ip: &str) {
        let keys: Vec<String> = ViolationKind::ALL
            .iter()
            .map(|kind| violation_key(*kind, ip))
            .collect();
        let mut cache = self.cache.clone();
        if let Err(e) = cache.del(&keys).await {
            tracing::debug!(%ip, error = %e, "violation counters not cleared");
        }
    }

    async fn is_whitelisted(&self, ip: &str) -> Result<bool, sqlx::Error> {
        ip_rules::has_active_allow(&self.db, ip).await
    }
}

pub fn violation_key(kind: ViolationKind, ip: &str) -> String {
    format!("violations:{}:{}", kind.as_str(), ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_abuse_table() {
        assert_eq!(ViolationKind::InvalidApiKey.threshold(), 10);
        assert_eq!(ViolationKind::InvalidApiKey.window_secs(), 60);
        assert_eq!(ViolationKind::InvalidApiKey.block_secs(), 3600);

        assert_eq!(ViolationKind::InvalidToken.threshold(), 20);
        assert_eq!(ViolationKind::RateLimitAbuse.threshold(), 50);
        assert_eq!(ViolationKind::RateLimitAbuse.window_secs(), 300);
        assert_eq!(ViolationKind::RateLimitAbuse.block_secs(), 1800);

        assert_eq!(ViolationKind::AuthFailure.threshold(), 30);
        assert_eq!(ViolationKind::AuthFailure.block_secs(), 7200);
    }

    #[test]
    fn violation_keys_are_partitioned_by_kind() {
        assert_eq!(
            violation_key(ViolationKind::InvalidToken, "203.0.113.7"),
            "violations:invalid_token:203.0.113.7"
        );
        assert_ne!(
            violation_key(ViolationKind::InvalidToken, "203.0.113.7"),
            violation_key(ViolationKind::AuthFailure, "203.0.113.7")
        );
    }
}
