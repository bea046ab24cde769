use crate::db::DbPool;
use crate::models::User;
use uuid::Uuid;

pub async fn find_by_email(pool: &DbPool, email: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(
        r#"
        SELECT id, email, password_hash, role, tier, token_version, created_at
        FROM users
        WHERE email = lower($1)
        "#,
    )
    .bind(email)
    .fetch_optional(pool)
    .await
}

pub async fn find_by_id(pool: &DbPool, id: Uuid) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(
        r#"
        SELECT id, email, password_hash, role, tier, token_version, created_at
        FROM users
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn create(pool: &DbPool, email: &str, password_hash: &str) -> Result<User, sqlx::Error> {
    sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (email, password_hash, role, tier, token_version)
        VALUES (lower($1), $2, 'user', 'free', 1)
        RETURNING id, email, password_hash, role, tier, token_version, created_at
        "#,
    )
    .bind(email)
    .bind(password_hash)
    .fetch_one(pool)
    .await
}

/// Current token_version; None when the user no longer exists.
pub async fn token_version(pool: &DbPool, id: Uuid) -> Result<Option<i32>, sqlx::Error> {
    sqlx::query_scalar::<_, i32>("SELECT token_version FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Mass revocation: every outstanding token for the user becomes stale.
pub async fn bump_token_version(pool: &DbPool, id: Uuid) -> Result<i32, sqlx::Error> {
    sqlx::query_scalar::<_, i32>(
        "UPDATE users SET token_version = token_version + 1 WHERE id = $1 RETURNING token_version",
    )
    .bind(id)
    .fetch_one(pool)
    .await
}

/// Password change doubles as mass revocation; both happen in one statement.
pub async fn update_password(
    pool: &DbPool,
    id: Uuid,
    password_hash: &str,
) -> Result<i32, sqlx::Error> {
    sqlx::query_scalar::<_, i32>(
        r#"
        UPDATE users
        SET password_hash = $2, token_version = token_version + 1
        WHERE id = $1
        RETURNING token_version
        "#,
    )
    .bind(id)
    .bind(password_hash)
    .fetch_one(pool)
    .await
}
