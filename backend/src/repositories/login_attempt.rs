use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use crate::models::login_attempt::LoginAttemptState;

/// Creates the counter row if needed and locks it for the surrounding transaction.
pub async fn lock_attempts(
    conn: &mut PgConnection,
    subject: &str,
) -> Result<LoginAttemptState, sqlx::Error> {
    sqlx::query("INSERT INTO login_attempts (subject) VALUES ($1) ON CONFLICT (subject) DO NOTHING")
        .bind(subject)
        .execute(&mut *conn)
        .await?;

    sqlx::query_as::<_, LoginAttemptState>(
        "SELECT failed_count, locked_until, lockout_count FROM login_attempts \
         WHERE subject = $1 FOR UPDATE",
    )
    .bind(subject)
    .fetch_one(&mut *conn)
    .await
}

pub async fn save_attempts(
    conn: &mut PgConnection,
    subject: &str,
    state: &LoginAttemptState,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE login_attempts \
         SET failed_count = $1, locked_until = $2, lockout_count = $3, updated_at = $4 \
         WHERE subject = $5",
    )
    .bind(state.failed_count)
    .bind(state.locked_until)
    .bind(state.lockout_count)
    .bind(now)
    .bind(subject)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn find_attempts(
    pool: &PgPool,
    subject: &str,
) -> Result<Option<LoginAttemptState>, sqlx::Error> {
    sqlx::query_as::<_, LoginAttemptState>(
        "SELECT failed_count, locked_until, lockout_count FROM login_attempts WHERE subject = $1",
    )
    .bind(subject)
    .fetch_optional(pool)
    .await
}

pub async fn delete_attempts(pool: &PgPool, subject: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM login_attempts WHERE subject = $1")
        .bind(subject)
        .execute(pool)
        .await?;
    Ok(())
}

/// Drops counters untouched since `cutoff` that are not holding a lock.
pub async fn delete_stale_attempts(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "DELETE FROM login_attempts \
         WHERE updated_at < $1 AND (locked_until IS NULL OR locked_until <= $2)",
    )
    .bind(cutoff)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
