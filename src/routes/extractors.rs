//! Credential resolution for proxied requests.
//!
//! Two surfaces, tried in order: `Authorization: Bearer <token>` then
//! `X-API-Key: <key>`. Every rejection except the benign expiries records a
//! violation against the client IP; a success clears the IP's counters.

use crate::auth::{blacklist_key, TokenType};
use crate::autoblock::ViolationKind;
use crate::context::AppContext;
use crate::error::{GatewayError, GatewayResult};
use crate::models::{digest_key, KeyStatus, Role, Tier};
use crate::store::{api_keys, users};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// TTL for the API key digest cache. A revoked key may keep working for up
/// to this long on instances that cached it.
const API_KEY_CACHE_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Bearer,
    ApiKey,
}

/// The authenticated principal attached to the request context.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: Uuid,
    pub role: Role,
    pub tier: Tier,
    pub api_key_id: Option<Uuid>,
    pub method: AuthMethod,
}

impl Caller {
    /// Rate-limit identifier: user id, then API key id, then client IP.
    pub fn rate_limit_identifier(&self) -> String {
        self.user_id.to_string()
    }
}

/// Identifier fallback for contexts without an authenticated caller.
pub fn rate_limit_identifier(caller: Option<&Caller>, client_ip: &str) -> String {
    match caller {
        Some(caller) => caller.rate_limit_identifier(),
        None => client_ip.to_string(),
    }
}

/// Resolve the caller's identity, recording violations on failure.
pub async fn authenticate(
    ctx: &Arc<AppContext>,
    headers: &HeaderMap,
    client_ip: &str,
) -> GatewayResult<Caller> {
    let outcome = if let Some(token) = bearer_token(headers) {
        authenticate_bearer(ctx, token).await
    } else if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        authenticate_api_key(ctx, key).await
    } else {
        Err(GatewayError::MissingCredentials)
    };

    match outcome {
        Ok(caller) => {
            // A legitimate caller forgives earlier stumbles from its IP.
            let blocker = ctx.blocker.clone();
            let ip = client_ip.to_string();
            tokio::spawn(async move { blocker.clear(&ip).await });
            Ok(caller)
        }
        Err(e) => {
            if let Some(kind) = violation_kind_for(&e) {
                ctx.blocker.record(kind, client_ip).await;
            }
            Err(e)
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Which violation counter an authentication failure feeds. Expired tokens
/// and keys are benign and feed none; this distinction is security-relevant.
fn violation_kind_for(error: &GatewayError) -> Option<ViolationKind> {
    match error {
        GatewayError::InvalidToken(_)
        | GatewayError::TokenRevoked
        | GatewayError::TokenVersionMismatch => Some(ViolationKind::InvalidToken),
        GatewayError::InvalidApiKey => Some(ViolationKind::InvalidApiKey),
        GatewayError::MissingCredentials | GatewayError::InvalidCredentials => {
            Some(ViolationKind::AuthFailure)
        }
        _ => None,
    }
}

async fn authenticate_bearer(ctx: &Arc<AppContext>, token: &str) -> GatewayResult<Caller> {
    let claims = ctx.auth.decode(token)?;

    if claims.typ != TokenType::Access {
        return Err(GatewayError::InvalidToken(
            "refresh token used as access token".into(),
        ));
    }

    let mut cache = ctx.cache.clone();
    if cache.exists(&blacklist_key(&claims.jti)).await? {
        return Err(GatewayError::TokenRevoked);
    }

    let user_id = Uuid::parse_str(&claims.sub)
        .map_err(|_| GatewayError::InvalidToken("malformed subject".into()))?;

    // Both revocation mechanisms are consulted: the per-jti blacklist above
    // and the user's current token_version here.
    let current_version = users::token_version(&ctx.db, user_id)
        .await?
        .ok_or_else(|| GatewayError::InvalidToken("unknown subject".into()))?;
    if current_version != claims.tv {
        return Err(GatewayError::TokenVersionMismatch);
    }

    let role = claims.role.parse().unwrap_or(Role::User);
    let tier = claims.tier.parse().unwrap_or(Tier::Free);

    Ok(Caller {
        user_id,
        role,
        tier,
        api_key_id: None,
        method: AuthMethod::Bearer,
    })
}

/// Cached result of a successful digest lookup.
#[derive(Serialize, Deserialize)]
struct CachedKeyAuth {
    key_id: Uuid,
    user_id: Uuid,
    role: Role,
    tier: Tier,
}

async fn authenticate_api_key(ctx: &Arc<AppContext>, raw_key: &str) -> GatewayResult<Caller> {
    let digest = digest_key(raw_key);
    let cache_key = format!("apikey:{}", digest);

    let mut cache = ctx.cache.clone();
    match cache.get::<String>(&cache_key).await {
        Ok(Some(serialized)) => {
            if let Ok(cached) = serde_json::from_str::<CachedKeyAuth>(&serialized) {
                touch_usage(ctx, cached.key_id);
                return Ok(Caller {
                    user_id: cached.user_id,
                    role: cached.role,
                    tier: cached.tier,
                    api_key_id: Some(cached.key_id),
                    method: AuthMethod::ApiKey,
                });
            }
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "api key cache unavailable"),
    }

    let key = api_keys::find_by_digest(&ctx.db, &digest)
        .await?
        .ok_or(GatewayError::InvalidApiKey)?;

    if key.status != KeyStatus::Active {
        return Err(GatewayError::InvalidApiKey);
    }
    if key.is_expired(Utc::now()) {
        return Err(GatewayError::ApiKeyExpired);
    }

    let user = users::find_by_id(&ctx.db, key.user_id)
        .await?
        .ok_or(GatewayError::InvalidApiKey)?;

    let cached = CachedKeyAuth {
        key_id: key.id,
        user_id: user.id,
        role: user.role,
        tier: user.tier,
    };
    if let Ok(serialized) = serde_json::to_string(&cached) {
        if let Err(e) = cache.set_ex(&cache_key, &serialized, API_KEY_CACHE_SECS).await {
            tracing::debug!(error = %e, "api key cache not primed");
        }
    }

    touch_usage(ctx, key.id);

    Ok(Caller {
        user_id: user.id,
        role: user.role,
        tier: user.tier,
        api_key_id: Some(key.id),
        method: AuthMethod::ApiKey,
    })
}

/// Best-effort `last_used_at` stamp, off the hot path.
fn touch_usage(ctx: &Arc<AppContext>, key_id: Uuid) {
    let db = ctx.db.clone();
    tokio::spawn(async move {
        if let Err(e) = api_keys::touch_last_used(&db, key_id).await {
            tracing::debug!(error = %e, %key_id, "last_used_at not updated");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiries_feed_no_violation_counter() {
        assert!(violation_kind_for(&GatewayError::TokenExpired).is_none());
        assert!(violation_kind_for(&GatewayError::ApiKeyExpired).is_none());
    }

    #[test]
    fn invalid_credentials_feed_their_counters() {
        assert_eq!(
            violation_kind_for(&GatewayError::InvalidApiKey),
            Some(ViolationKind::InvalidApiKey)
        );
        assert_eq!(
            violation_kind_for(&GatewayError::InvalidToken("sig".into())),
            Some(ViolationKind::InvalidToken)
        );
        assert_eq!(
            violation_kind_for(&GatewayError::TokenVersionMismatch),
            Some(ViolationKind::InvalidToken)
        );
        assert_eq!(
            violation_kind_for(&GatewayError::MissingCredentials),
            Some(ViolationKind::AuthFailure)
        );
    }

    #[test]
    fn identifier_prefers_user_then_ip() {
        let caller = Caller {
            user_id: Uuid::nil(),
            role: Role::User,
            tier: Tier::Free,
            api_key_id: None,
            method: AuthMethod::Bearer,
        };
        assert_eq!(
            rate_limit_identifier(Some(&caller), "203.0.113.7"),
            Uuid::nil().to_string()
        );
        assert_eq!(rate_limit_identifier(None, "203.0.113.7"), "203.0.113.7");
    }
}
