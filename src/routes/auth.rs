//! Authentication surface: signup, login, refresh, logout, logout-all, and
//! password change.
//!
//! Token rotation is the delicate part: the presented refresh token's nonce
//! is blacklisted with a set-if-not-exists before any new pair is issued, so
//! two concurrent refreshes produce exactly one winner.

use crate::audit::{AuditEvent, AuditEventType};
use crate::auth::{blacklist_key, refresh_key, TokenPair, TokenType};
use crate::autoblock::ViolationKind;
use crate::context::AppContext;
use crate::error::{GatewayError, GatewayResult};
use crate::models::User;
use crate::routes::extractors::authenticate;
use crate::routes::middleware::RequestMeta;
use crate::store::users;
use crate::utils::{log_safe_id, validate_password_strength};
use axum::extract::State;
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct CredentialsRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

pub async fn signup(
    State(ctx): State<Arc<AppContext>>,
    Extension(meta): Extension<RequestMeta>,
    Json(body): Json<CredentialsRequest>,
) -> GatewayResult<impl IntoResponse> {
    let email = body.email.trim().to_lowercase();
    if email.len() > 254 || !email.contains('@') {
        return Err(GatewayError::Validation("invalid email address".into()));
    }
    validate_password_strength(&body.password).map_err(GatewayError::Validation)?;

    let password_hash = bcrypt::hash(&body.password, bcrypt::DEFAULT_COST)
        .map_err(|e| GatewayError::Internal(format!("password hashing failed: {}", e)))?;

    let user = match users::create(&ctx.db, &email, &password_hash).await {
        Ok(user) => user,
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            return Err(GatewayError::Validation("email is already registered".into()));
        }
        Err(e) => return Err(e.into()),
    };

    let pair = issue_tracked_pair(&ctx, &user).await?;

    ctx.audit
        .record(
            AuditEvent::new(AuditEventType::Signup)
                .actor(user.id)
                .ip(&meta.client_ip)
                .resource("user", &user.id.to_string()),
        )
        .await?;

    tracing::info!(
        user = %log_safe_id(&user.id.to_string(), &ctx.config.log_hash_salt),
        "user signed up"
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "user": user_summary(&user),
            "tokens": pair,
        })),
    ))
}

pub async fn login(
    State(ctx): State<Arc<AppContext>>,
    Extension(meta): Extension<RequestMeta>,
    Json(body): Json<CredentialsRequest>,
) -> GatewayResult<impl IntoResponse> {
    let user = match users::find_by_email(&ctx.db, body.email.trim()).await? {
        Some(user) => user,
        None => return Err(login_failure(&ctx, &meta, &body.email).await),
    };

    let verified = bcrypt::verify(&body.password, &user.password_hash)
        .map_err(|e| GatewayError::Internal(format!("password verification failed: {}", e)))?;
    if !verified {
        return Err(login_failure(&ctx, &meta, &body.email).await);
    }

    let pair = issue_tracked_pair(&ctx, &user).await?;

    let blocker = ctx.blocker.clone();
    let ip = meta.client_ip.clone();
    tokio::spawn(async move { blocker.clear(&ip).await });

    ctx.audit
        .record_best_effort(
            AuditEvent::new(AuditEventType::Login)
                .actor(user.id)
                .ip(&meta.client_ip),
        )
        .await;

    Ok(Json(json!({
        "success": true,
        "user": user_summary(&user),
        "tokens": pair,
    })))
}

async fn login_failure(
    ctx: &Arc<AppContext>,
    meta: &RequestMeta,
    email: &str,
) -> GatewayError {
    ctx.blocker
        .record(ViolationKind::AuthFailure, &meta.client_ip)
        .await;
    ctx.audit
        .record_best_effort(
            AuditEvent::new(AuditEventType::AuthenticationFailure)
                .ip(&meta.client_ip)
                .metadata(json!({
                    "email": log_safe_id(email, &ctx.config.log_hash_salt),
                })),
        )
        .await;
    GatewayError::InvalidCredentials
}

pub async fn refresh(
    State(ctx): State<Arc<AppContext>>,
    Extension(meta): Extension<RequestMeta>,
    Json(body): Json<RefreshRequest>,
) -> GatewayResult<impl IntoResponse> {
    let claims = ctx.auth.decode(&body.refresh_token)?;
    if claims.typ != TokenType::Refresh {
        return Err(GatewayError::InvalidToken(
            "access token used as refresh token".into(),
        ));
    }
    let user_id = Uuid::parse_str(&claims.sub)
        .map_err(|_| GatewayError::InvalidToken("malformed subject".into()))?;

    // Rotation: blacklist the presented nonce before issuing anything. The
    // set-if-not-exists is the arbiter under concurrent refreshes; exactly
    // one caller wins the rotation.
    let remaining = claims.remaining_secs(Utc::now().timestamp()).max(1);
    let mut cache = ctx.cache.clone();
    let won = cache
        .set_nx_ex(&blacklist_key(&claims.jti), "rotated", remaining)
        .await?;
    if !won {
        ctx.blocker
            .record(ViolationKind::InvalidToken, &meta.client_ip)
            .await;
        return Err(GatewayError::TokenRevoked);
    }

    // The refresh token must still be tracked; an untracked nonce was either
    // never issued against this cache or already rotated out.
    let tracked_key = refresh_key(&claims.sub, &claims.jti);
    if !cache.exists(&tracked_key).await? {
        return Err(GatewayError::TokenRevoked);
    }
    cache.del(&[tracked_key]).await?;

    let user = users::find_by_id(&ctx.db, user_id)
        .await?
        .ok_or_else(|| GatewayError::InvalidToken("unknown subject".into()))?;
    if user.token_version != claims.tv {
        return Err(GatewayError::TokenVersionMismatch);
    }

    let pair = issue_tracked_pair(&ctx, &user).await?;

    ctx.audit
        .record_best_effort(
            AuditEvent::new(AuditEventType::TokenRefresh)
                .actor(user.id)
                .ip(&meta.client_ip)
                .metadata(json!({ "rotated_jti": claims.jti })),
        )
        .await;

    Ok(Json(json!({ "success": true, "tokens": pair })))
}

pub async fn logout(
    State(ctx): State<Arc<AppContext>>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
) -> GatewayResult<impl IntoResponse> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(GatewayError::MissingCredentials)?;

    let claims = match ctx.auth.decode(token) {
        Ok(claims) => claims,
        // An expired token has nothing left to revoke.
        Err(GatewayError::TokenExpired) => {
            return Ok(Json(json!({ "success": true })));
        }
        Err(e) => return Err(e),
    };
    if claims.typ != TokenType::Access {
        return Err(GatewayError::InvalidToken(
            "logout requires an access token".into(),
        ));
    }

    let remaining = claims.remaining_secs(Utc::now().timestamp()).max(1);
    let mut cache = ctx.cache.clone();
    cache
        .set_ex(&blacklist_key(&claims.jti), "logout", remaining)
        .await?;

    if let Ok(user_id) = Uuid::parse_str(&claims.sub) {
        ctx.audit
            .record_best_effort(
                AuditEvent::new(AuditEventType::Logout)
                    .actor(user_id)
                    .ip(&meta.client_ip),
            )
            .await;
    }

    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
pub struct PasswordChangeRequest {
    pub current_password: String,
    pub new_password: String,
}

/// "Log out everywhere": bump token_version, invalidating every outstanding
/// token for the caller in O(1), with no per-token tracking.
pub async fn logout_all(
    State(ctx): State<Arc<AppContext>>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
) -> GatewayResult<impl IntoResponse> {
    let caller = authenticate(&ctx, &headers, &meta.client_ip).await?;

    let version = users::bump_token_version(&ctx.db, caller.user_id).await?;

    ctx.audit
        .record(
            AuditEvent::new(AuditEventType::SessionRevocation)
                .actor(caller.user_id)
                .ip(&meta.client_ip)
                .changes(json!({ "token_version": version })),
        )
        .await?;

    Ok(Json(json!({ "success": true })))
}

/// Password change. The same statement that stores the new digest bumps
/// token_version, so every session issued against the old password dies
/// with it; a fresh pair is returned for the current session.
pub async fn change_password(
    State(ctx): State<Arc<AppContext>>,
    Extension(meta): Extension<RequestMeta>,
    headers: HeaderMap,
    Json(body): Json<PasswordChangeRequest>,
) -> GatewayResult<impl IntoResponse> {
    let caller = authenticate(&ctx, &headers, &meta.client_ip).await?;

    let user = users::find_by_id(&ctx.db, caller.user_id)
        .await?
        .ok_or(GatewayError::InvalidCredentials)?;

    let verified = bcrypt::verify(&body.current_password, &user.password_hash)
        .map_err(|e| GatewayError::Internal(format!("password verification failed: {}", e)))?;
    if !verified {
        ctx.blocker
            .record(ViolationKind::AuthFailure, &meta.client_ip)
            .await;
        return Err(GatewayError::InvalidCredentials);
    }

    validate_password_strength(&body.new_password).map_err(GatewayError::Validation)?;

    let password_hash = bcrypt::hash(&body.new_password, bcrypt::DEFAULT_COST)
        .map_err(|e| GatewayError::Internal(format!("password hashing failed: {}", e)))?;
    let version = users::update_password(&ctx.db, user.id, &password_hash).await?;

    ctx.audit
        .record(
            AuditEvent::new(AuditEventType::PasswordChange)
                .actor(user.id)
                .ip(&meta.client_ip)
                .changes(json!({ "token_version": version })),
        )
        .await?;

    // Re-read so the fresh pair carries the bumped version.
    let user = users::find_by_id(&ctx.db, user.id)
        .await?
        .ok_or_else(|| GatewayError::Internal("user vanished during password change".into()))?;
    let pair = issue_tracked_pair(&ctx, &user).await?;

    Ok(Json(json!({ "success": true, "tokens": pair })))
}

/// Issue a pair and track the refresh nonce in the shared cache.
async fn issue_tracked_pair(ctx: &Arc<AppContext>, user: &User) -> GatewayResult<TokenPair> {
    let pair = ctx.auth.issue_pair(user)?;
    let ttl = ctx.config.auth.refresh_token_ttl_secs.max(1) as u64;
    let mut cache = ctx.cache.clone();
    cache
        .set_ex(
            &refresh_key(&user.id.to_string(), &pair.refresh_jti),
            "1",
            ttl,
        )
        .await?;
    Ok(pair)
}

fn user_summary(user: &User) -> serde_json::Value {
    json!({
        "id": user.id,
        "email": user.email,
        "role": user.role,
        "tier": user.tier,
    })
}
