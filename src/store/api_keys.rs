use crate::db::DbPool;
use crate::models::{ApiKey, MintedKey};
use chrono::{DateTime, Utc};
use uuid::Uuid;

const COLUMNS: &str = "id, user_id, key_digest, prefix, display_name, scopes, status, \
                       expires_at, last_used_at, created_at";

pub async fn find_by_digest(pool: &DbPool, digest: &str) -> Result<Option<ApiKey>, sqlx::Error> {
    sqlx::query_as::<_, ApiKey>(&format!(
        "SELECT {COLUMNS} FROM api_keys WHERE key_digest = $1"
    ))
    .bind(digest)
    .fetch_optional(pool)
    .await
}

/// Persist a freshly minted key. The caller is responsible for handing the
/// plaintext to the requester exactly once; it is never stored.
pub async fn create(
    pool: &DbPool,
    user_id: Uuid,
    display_name: &str,
    scopes: &[String],
    expires_at: Option<DateTime<Utc>>,
    minted: &MintedKey,
) -> Result<ApiKey, sqlx::Error> {
    sqlx::query_as::<_, ApiKey>(&format!(
        r#"
        INSERT INTO api_keys (user_id, key_digest, prefix, display_name, scopes, status, expires_at)
        VALUES ($1, $2, $3, $4, $5, 'active', $6)
        RETURNING {COLUMNS}
        "#
    ))
    .bind(user_id)
    .bind(&minted.digest)
    .bind(&minted.prefix)
    .bind(display_name)
    .bind(scopes)
    .bind(expires_at)
    .fetch_one(pool)
    .await
}

/// Best-effort usage stamp; callers spawn this off the hot path.
pub async fn touch_last_used(pool: &DbPool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE api_keys SET last_used_at = now() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}
