use crate::db::DbPool;
use crate::models::IpRule;
use chrono::{DateTime, Utc};

const COLUMNS: &str =
    "id, ip_address, rule_type, reason, auto_blocked, expires_at, created_at";

/// All rules for an IP that have not expired.
pub async fn active_rules_for(pool: &DbPool, ip: &str) -> Result<Vec<IpRule>, sqlx::Error> {
    sqlx::query_as::<_, IpRule>(&format!(
        r#"
        SELECT {COLUMNS}
        FROM ip_rules
        WHERE ip_address = $1 AND (expires_at IS NULL OR expires_at > now())
        ORDER BY created_at
        "#
    ))
    .bind(ip)
    .fetch_all(pool)
    .await
}

pub async fn has_active_allow(pool: &DbPool, ip: &str) -> Result<bool, sqlx::Error> {
    let found: Option<i32> = sqlx::query_scalar(
        r#"
        SELECT 1
        FROM ip_rules
        WHERE ip_address = $1
          AND rule_type = 'allow'
          AND (expires_at IS NULL OR expires_at > now())
        LIMIT 1
        "#,
    )
    .bind(ip)
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

pub async fn insert_block(
    pool: &DbPool,
    ip: &str,
    reason: &str,
    auto_blocked: bool,
    expires_at: Option<DateTime<Utc>>,
) -> Result<IpRule, sqlx::Error> {
    sqlx::query_as::<_, IpRule>(&format!(
        r#"
        INSERT INTO ip_rules (ip_address, rule_type, reason, auto_blocked, expires_at)
        VALUES ($1, 'block', $2, $3, $4)
        RETURNING {COLUMNS}
        "#
    ))
    .bind(ip)
    .bind(reason)
    .bind(auto_blocked)
    .bind(expires_at)
    .fetch_one(pool)
    .await
}
