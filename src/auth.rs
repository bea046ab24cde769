use crate::config::AuthConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::models::User;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub jti: String, // unique per token; blacklisting handle
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub typ: TokenType,
    /// User's token_version at issue time. A bump invalidates every
    /// outstanding token without per-token tracking.
    pub tv: i32,
    pub role: String,
    pub tier: String,
}

impl Claims {
    /// Seconds until expiry, floored at zero.
    pub fn remaining_secs(&self, now_ts: i64) -> u64 {
        (self.exp - now_ts).max(0) as u64
    }
}

#[derive(Debug, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    #[serde(skip)]
    pub refresh_jti: String,
    #[serde(skip)]
    pub refresh_expires_at: i64,
}

pub struct AuthManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
}

impl AuthManager {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            issuer: config.jwt_issuer.clone(),
            access_ttl_secs: config.access_token_ttl_secs,
            refresh_ttl_secs: config.refresh_token_ttl_secs,
        }
    }

    /// Issue an access + refresh pair for a user.
    pub fn issue_pair(&self, user: &User) -> GatewayResult<TokenPair> {
        let (access_token, _, _) = self.issue(user, TokenType::Access, self.access_ttl_secs)?;
        let (refresh_token, refresh_jti, refresh_exp) =
            self.issue(user, TokenType::Refresh, self.refresh_ttl_secs)?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: self.access_ttl_secs,
            refresh_jti,
            refresh_expires_at: refresh_exp,
        })
    }

    fn issue(&self, user: &User, typ: TokenType, ttl_secs: i64) -> GatewayResult<(String, String, i64)> {
        let now = Utc::now();
        let exp = now + Duration::seconds(ttl_secs);
        let jti = Uuid::new_v4().to_string();

        let claims = Claims {
            sub: user.id.to_string(),
            jti: jti.clone(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: self.issuer.clone(),
            typ,
            tv: user.token_version,
            role: user.role.as_str().to_string(),
            tier: user.tier.as_str().to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| GatewayError::Internal(format!("token encoding failed: {}", e)))?;

        Ok((token, jti, exp.timestamp()))
    }

    /// Verify signature, expiry, and issuer. Expiry maps to the benign
    /// `TOKEN_EXPIRED`; every other decode failure is `INVALID_TOKEN`.
    pub fn decode(&self, token: &str) -> GatewayResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.issuer.clone()]);
        validation.leeway = 0;

        match decode::<Claims>(token, &self.decoding_key, &validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(GatewayError::TokenExpired),
                _ => Err(GatewayError::InvalidToken(e.to_string())),
            },
        }
    }
}

/// Shared-cache key for an individually revoked token.
pub fn blacklist_key(jti: &str) -> String {
    format!("blacklist:{}", jti)
}

/// Shared-cache key tracking an outstanding refresh token.
pub fn refresh_key(user_id: &str, jti: &str) -> String {
    format!("refresh:{}:{}", user_id, jti)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Role, Tier};

    fn test_manager() -> AuthManager {
        AuthManager::new(&AuthConfig {
            jwt_secret: "0123456789abcdef0123456789abcdef".into(),
            jwt_issuer: "portcullis-test".into(),
            access_token_ttl_secs: 900,
            refresh_token_ttl_secs: 86400,
        })
    }

    fn test_user() -> User {
        User {
            id: Uuid::new_v4(),
            email: "probe@example.com".into(),
            password_hash: String::new(),
            role: Role::User,
            tier: Tier::Pro,
            token_version: 3,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn pair_round_trips_claims() {
        let manager = test_manager();
        let user = test_user();
        let pair = manager.issue_pair(&user).unwrap();

        let access = manager.decode(&pair.access_token).unwrap();
        assert_eq!(access.sub, user.id.to_string());
        assert_eq!(access.typ, TokenType::Access);
        assert_eq!(access.tv, 3);
        assert_eq!(access.role, "user");
        assert_eq!(access.tier, "pro");

        let refresh = manager.decode(&pair.refresh_token).unwrap();
        assert_eq!(refresh.typ, TokenType::Refresh);
        assert_eq!(refresh.jti, pair.refresh_jti);
        assert_ne!(access.jti, refresh.jti);
    }

    #[test]
    fn expired_token_yields_token_expired() {
        let manager = test_manager();
        let user = test_user();
        let (token, _, _) = manager.issue(&user, TokenType::Access, -60).unwrap();

        match manager.decode(&token) {
            Err(GatewayError::TokenExpired) => {}
            other => panic!("expected TokenExpired, got {other:?}"),
        }
    }

    #[test]
    fn tampered_token_yields_invalid_token() {
        let manager = test_manager();
        let user = test_user();
        let pair = manager.issue_pair(&user).unwrap();
        let mut tampered = pair.access_token;
        tampered.pop();
        tampered.push('A');

        match manager.decode(&tampered) {
            Err(GatewayError::InvalidToken(_)) => {}
            other => panic!("expected InvalidToken, got {other:?}"),
        }
    }

    #[test]
    fn foreign_issuer_is_rejected() {
        let manager = test_manager();
        let foreign = AuthManager::new(&AuthConfig {
            jwt_secret: "0123456789abcdef0123456789abcdef".into(),
            jwt_issuer: "someone-else".into(),
            access_token_ttl_secs: 900,
            refresh_token_ttl_secs: 86400,
        });
        let pair = foreign.issue_pair(&test_user()).unwrap();

        assert!(matches!(
            manager.decode(&pair.access_token),
            Err(GatewayError::InvalidToken(_))
        ));
    }

    #[test]
    fn remaining_secs_floors_at_zero() {
        let claims = Claims {
            sub: "u".into(),
            jti: "j".into(),
            iat: 0,
            exp: 100,
            iss: "i".into(),
            typ: TokenType::Access,
            tv: 1,
            role: "user".into(),
            tier: "free".into(),
        };
        assert_eq!(claims.remaining_secs(40), 60);
        assert_eq!(claims.remaining_secs(200), 0);
    }
}
