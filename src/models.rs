use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ============================================================================
// Enumerations
// ============================================================================

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        concat!("unknown ", stringify!($name), " value: {}"),
                        other
                    )),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }
    };
}

text_enum!(Role {
    User => "user",
    Admin => "admin",
});

text_enum!(Tier {
    Free => "free",
    Pro => "pro",
    Enterprise => "enterprise",
});

text_enum!(KeyStatus {
    Active => "active",
    Revoked => "revoked",
    Deprecated => "deprecated",
});

text_enum!(Strategy {
    TokenBucket => "token_bucket",
    LeakyBucket => "leaky_bucket",
    FixedWindow => "fixed_window",
    SlidingWindow => "sliding_window",
    Concurrency => "concurrency",
});

text_enum!(FailureMode {
    Open => "open",
    Closed => "closed",
});

text_enum!(RuleType {
    Block => "block",
    Allow => "allow",
});

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    #[sqlx(try_from = "String")]
    pub role: Role,
    #[sqlx(try_from = "String")]
    pub tier: Tier,
    pub token_version: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKey {
    pub id: Uuid,
    pub user_id: Uuid,
    pub key_digest: String,
    pub prefix: String,
    pub display_name: String,
    pub scopes: Vec<String>,
    #[sqlx(try_from = "String")]
    pub status: KeyStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }

    /// Scope check: key scopes are "resource:action" strings with `*`
    /// permitted on either side; a bare `*` grants everything. Not enforced
    /// on the proxy hot path; backends own per-endpoint authorization.
    pub fn allows_scope(&self, required: &str) -> bool {
        let (req_res, req_act) = split_scope(required);
        self.scopes.iter().any(|granted| {
            let (res, act) = split_scope(granted);
            (res == "*" || res == req_res) && (act == "*" || act == req_act)
        })
    }
}

fn split_scope(scope: &str) -> (&str, &str) {
    match scope.split_once(':') {
        Some((r, a)) => (r, a),
        None => (scope, "*"),
    }
}

/// A freshly minted API key. The plaintext exists only in this value; the
/// store persists the digest and prefix.
pub struct MintedKey {
    pub plaintext: String,
    pub digest: String,
    pub prefix: String,
}

impl MintedKey {
    pub fn generate() -> Self {
        let body: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        let plaintext = format!("pk_live_{}", body);
        Self {
            prefix: plaintext[..12].to_string(),
            digest: digest_key(&plaintext),
            plaintext,
        }
    }
}

/// One-way digest used for API key lookup. No reversible form exists.
pub fn digest_key(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiDefinition {
    pub id: Uuid,
    pub name: String,
    pub route_pattern: String,
    pub backend_url: String,
    pub allowed_methods: Vec<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl ApiDefinition {
    pub fn method_allowed(&self, method: &str) -> bool {
        self.allowed_methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RateLimitPolicy {
    pub id: Uuid,
    pub api_definition_id: Uuid,
    pub tier: Option<String>,
    #[sqlx(try_from = "String")]
    pub strategy: Strategy,
    pub capacity: i32,
    pub refill_rate: Option<f64>,
    pub window_seconds: Option<i32>,
    /// When unset, the gateway-wide default failure mode applies.
    pub failure_mode: Option<String>,
}

impl RateLimitPolicy {
    /// Behavior when the shared cache is unreachable: fail open (allow) or
    /// fail closed (reject). Policies may defer to the gateway default.
    pub fn fails_open(&self, default_fail_open: bool) -> bool {
        match self.failure_mode.as_deref() {
            Some("closed") => false,
            Some("open") => true,
            _ => default_fail_open,
        }
    }

    /// Strategy-specific parameter validation, applied when policies load.
    pub fn validate(&self) -> Result<(), String> {
        if self.capacity <= 0 {
            return Err(format!("policy {}: capacity must be positive", self.id));
        }
        if let Some(mode) = self.failure_mode.as_deref() {
            if mode.parse::<FailureMode>().is_err() {
                return Err(format!("policy {}: unknown failure_mode '{}'", self.id, mode));
            }
        }
        match self.strategy {
            Strategy::TokenBucket | Strategy::LeakyBucket => {
                match self.refill_rate {
                    Some(r) if r >= 0.0 => Ok(()),
                    _ => Err(format!(
                        "policy {}: {} requires refill_rate",
                        self.id, self.strategy
                    )),
                }
            }
            Strategy::FixedWindow | Strategy::SlidingWindow => match self.window_seconds {
                Some(w) if w > 0 => Ok(()),
                _ => Err(format!(
                    "policy {}: {} requires window_seconds",
                    self.id, self.strategy
                )),
            },
            Strategy::Concurrency => Ok(()),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IpRule {
    pub id: Uuid,
    pub ip_address: String,
    #[sqlx(try_from = "String")]
    pub rule_type: RuleType,
    pub reason: Option<String>,
    pub auto_blocked: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl IpRule {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| t > now).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key_with_scopes(scopes: &[&str]) -> ApiKey {
        ApiKey {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            key_digest: "d".into(),
            prefix: "pk_live_abcd".into(),
            display_name: "test".into(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            status: KeyStatus::Active,
            expires_at: None,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn scope_wildcards_match_either_side() {
        let key = key_with_scopes(&["orders:read", "billing:*", "*:list"]);
        assert!(key.allows_scope("orders:read"));
        assert!(!key.allows_scope("orders:write"));
        assert!(key.allows_scope("billing:refund"));
        assert!(key.allows_scope("inventory:list"));
        assert!(!key.allows_scope("inventory:read"));
    }

    #[test]
    fn bare_star_grants_everything() {
        let key = key_with_scopes(&["*"]);
        assert!(key.allows_scope("anything:at_all"));
    }

    #[test]
    fn minted_key_digest_is_not_plaintext() {
        let minted = MintedKey::generate();
        assert!(minted.plaintext.starts_with("pk_live_"));
        assert_eq!(minted.prefix.len(), 12);
        assert_ne!(minted.digest, minted.plaintext);
        assert_eq!(minted.digest, digest_key(&minted.plaintext));
        // Digest is stable and 64 hex chars (SHA-256)
        assert_eq!(minted.digest.len(), 64);
    }

    #[test]
    fn policy_validation_requires_strategy_params() {
        let mut policy = RateLimitPolicy {
            id: Uuid::new_v4(),
            api_definition_id: Uuid::new_v4(),
            tier: None,
            strategy: Strategy::TokenBucket,
            capacity: 10,
            refill_rate: None,
            window_seconds: None,
            failure_mode: None,
        };
        assert!(policy.validate().is_err());

        policy.refill_rate = Some(2.0);
        assert!(policy.validate().is_ok());

        policy.strategy = Strategy::FixedWindow;
        assert!(policy.validate().is_err());
        policy.window_seconds = Some(60);
        assert!(policy.validate().is_ok());

        policy.capacity = 0;
        assert!(policy.validate().is_err());
        policy.capacity = 10;

        policy.failure_mode = Some("sideways".into());
        assert!(policy.validate().is_err());
        policy.failure_mode = Some("closed".into());
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn failure_mode_defers_to_gateway_default() {
        let mut policy = RateLimitPolicy {
            id: Uuid::new_v4(),
            api_definition_id: Uuid::new_v4(),
            tier: None,
            strategy: Strategy::FixedWindow,
            capacity: 10,
            refill_rate: None,
            window_seconds: Some(60),
            failure_mode: None,
        };
        assert!(policy.fails_open(true));
        assert!(!policy.fails_open(false));
        policy.failure_mode = Some("closed".into());
        assert!(!policy.fails_open(true));
        policy.failure_mode = Some("open".into());
        assert!(policy.fails_open(false));
    }

    #[test]
    fn ip_rule_activity_follows_expiry() {
        let now = Utc::now();
        let mut rule = IpRule {
            id: Uuid::new_v4(),
            ip_address: "203.0.113.7".into(),
            rule_type: RuleType::Block,
            reason: None,
            auto_blocked: true,
            expires_at: Some(now + Duration::hours(1)),
            created_at: now,
        };
        assert!(rule.is_active(now));
        rule.expires_at = Some(now - Duration::seconds(1));
        assert!(!rule.is_active(now));
        rule.expires_at = None;
        assert!(rule.is_active(now));
    }

    #[test]
    fn enum_round_trips() {
        assert_eq!("token_bucket".parse::<Strategy>().unwrap(), Strategy::TokenBucket);
        assert_eq!(Strategy::SlidingWindow.as_str(), "sliding_window");
        assert!("warp_drive".parse::<Strategy>().is_err());
        assert_eq!("enterprise".parse::<Tier>().unwrap(), Tier::Enterprise);
        assert_eq!("closed".parse::<FailureMode>().unwrap(), FailureMode::Closed);
    }
}
