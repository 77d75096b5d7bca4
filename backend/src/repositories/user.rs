use chrono::Utc;
use sqlx::PgPool;

use crate::models::user::User;

pub async fn find_by_email(pool: &PgPool, email: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(
        "SELECT email, password_hash, roles, created_at, updated_at FROM users WHERE email = $1",
    )
    .bind(email)
    .fetch_optional(pool)
    .await
}

pub async fn insert_user(pool: &PgPool, user: &User) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO users (email, password_hash, roles, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(&user.email)
    .bind(&user.password_hash)
    .bind(&user.roles)
    .bind(user.created_at)
    .bind(user.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_password_hash(
    pool: &PgPool,
    email: &str,
    password_hash: &str,
) -> Result<bool, sqlx::Error> {
    let result =
        sqlx::query("UPDATE users SET password_hash = $1, updated_at = $2 WHERE email = $3")
            .bind(password_hash)
            .bind(Utc::now())
            .bind(email)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}
