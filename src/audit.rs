//! Audit logging for security-relevant events.
//!
//! Records are append-only and written synchronously: an auto-block or a
//! revocation that is not durably recorded did not happen. Every record is
//! also emitted as a structured tracing event under `target: "audit"` for
//! SIEM pipelines.

use crate::db::DbPool;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    Signup,
    Login,
    Logout,
    TokenRefresh,
    AuthenticationFailure,
    PasswordChange,
    SessionRevocation,
    RateLimitViolation,
    IpAutoBlocked,
    IpBlockLifted,
    ApiKeyCreated,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Signup => "SIGNUP",
            Self::Login => "LOGIN",
            Self::Logout => "LOGOUT",
            Self::TokenRefresh => "TOKEN_REFRESH",
            Self::AuthenticationFailure => "AUTHENTICATION_FAILURE",
            Self::PasswordChange => "PASSWORD_CHANGE",
            Self::SessionRevocation => "SESSION_REVOCATION",
            Self::RateLimitViolation => "RATE_LIMIT_VIOLATION",
            Self::IpAutoBlocked => "IP_AUTO_BLOCKED",
            Self::IpBlockLifted => "IP_BLOCK_LIFTED",
            Self::ApiKeyCreated => "API_KEY_CREATED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub actor_user_id: Option<Uuid>,
    pub actor_ip: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub changes: Value,
    pub metadata: Value,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_type,
            actor_user_id: None,
            actor_ip: None,
            resource_type: None,
            resource_id: None,
            changes: json!({}),
            metadata: json!({}),
        }
    }

    pub fn actor(mut self, user_id: Uuid) -> Self {
        self.actor_user_id = Some(user_id);
        self
    }

    pub fn ip(mut self, ip: &str) -> Self {
        self.actor_ip = Some(ip.to_string());
        self
    }

    pub fn resource(mut self, resource_type: &str, resource_id: &str) -> Self {
        self.resource_type = Some(resource_type.to_string());
        self.resource_id = Some(resource_id.to_string());
        self
    }

    pub fn changes(mut self, changes: Value) -> Self {
        self.changes = changes;
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Clone)]
pub struct AuditLogger {
    db: DbPool,
}

impl AuditLogger {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Persist an audit record. The write is synchronous; failures surface
    /// to the caller so security-critical paths can refuse to proceed.
    pub async fn record(&self, event: AuditEvent) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs
                (event_type, actor_user_id, actor_ip, resource_type, resource_id, changes, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.event_type.as_str())
        .bind(event.actor_user_id)
        .bind(&event.actor_ip)
        .bind(&event.resource_type)
        .bind(&event.resource_id)
        .bind(&event.changes)
        .bind(&event.metadata)
        .execute(&self.db)
        .await?;

        tracing::info!(
            target: "audit",
            event_type = event.event_type.as_str(),
            actor_user_id = ?event.actor_user_id,
            actor_ip = event.actor_ip.as_deref(),
            resource_type = event.resource_type.as_deref(),
            resource_id = event.resource_id.as_deref(),
            changes = %event.changes,
            "audit event"
        );

        Ok(())
    }

    /// Best-effort variant for paths where an audit failure must not take
    /// down the request (e.g. successful-login bookkeeping).
    pub async fn record_best_effort(&self, event: AuditEvent) {
        let event_type = event.event_type.as_str();
        if let Err(e) = self.record(event).await {
            tracing::error!(error = %e, event_type, "audit write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_populates_fields() {
        let user = Uuid::new_v4();
        let event = AuditEvent::new(AuditEventType::IpAutoBlocked)
            .actor(user)
            .ip("203.0.113.7")
            .resource("ip_rule", "rule-1")
            .changes(json!({"rule_type": "block"}))
            .metadata(json!({"kind": "invalid_api_key"}));

        assert_eq!(event.actor_user_id, Some(user));
        assert_eq!(event.actor_ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(event.resource_type.as_deref(), Some("ip_rule"));
        assert_eq!(event.changes["rule_type"], "block");
        assert_eq!(event.event_type.as_str(), "IP_AUTO_BLOCKED");
    }
}
