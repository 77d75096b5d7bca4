//! SQL access for `refresh_token_families`.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use crate::models::session::{RefreshTokenFamily, RevokeReason};
use crate::types::FamilyId;

const FAMILY_COLUMNS: &str = "family_id, subject, current_token_hash, previous_token_hash, \
     device_fingerprint, issuing_ip, last_seen_ip, provider, issued_at, last_rotated_at, \
     absolute_expires_at, revoked, revoked_reason, revoked_at, version";

pub async fn insert_family(
    pool: &PgPool,
    family: &RefreshTokenFamily,
) -> Result<RefreshTokenFamily, sqlx::Error> {
    let query = format!(
        "INSERT INTO refresh_token_families ({cols}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
         RETURNING {cols}",
        cols = FAMILY_COLUMNS
    );
    sqlx::query_as::<_, RefreshTokenFamily>(&query)
        .bind(family.family_id)
        .bind(&family.subject)
        .bind(&family.current_token_hash)
        .bind(&family.previous_token_hash)
        .bind(&family.device_fingerprint)
        .bind(&family.issuing_ip)
        .bind(&family.last_seen_ip)
        .bind(&family.provider)
        .bind(family.issued_at)
        .bind(family.last_rotated_at)
        .bind(family.absolute_expires_at)
        .bind(family.revoked)
        .bind(family.revoked_reason)
        .bind(family.revoked_at)
        .bind(family.version)
        .fetch_one(pool)
        .await
}

pub async fn find_family(
    pool: &PgPool,
    family_id: FamilyId,
) -> Result<Option<RefreshTokenFamily>, sqlx::Error> {
    let query = format!(
        "SELECT {} FROM refresh_token_families WHERE family_id = $1",
        FAMILY_COLUMNS
    );
    sqlx::query_as::<_, RefreshTokenFamily>(&query)
        .bind(family_id)
        .fetch_optional(pool)
        .await
}

/// Row-locks the family for the rest of the surrounding transaction.
pub async fn lock_family(
    conn: &mut PgConnection,
    family_id: FamilyId,
) -> Result<Option<RefreshTokenFamily>, sqlx::Error> {
    let query = format!(
        "SELECT {} FROM refresh_token_families WHERE family_id = $1 FOR UPDATE",
        FAMILY_COLUMNS
    );
    sqlx::query_as::<_, RefreshTokenFamily>(&query)
        .bind(family_id)
        .fetch_optional(conn)
        .await
}

/// Persists a rotation computed in memory. Returns `false` when the stored
/// version moved underneath the caller.
pub async fn update_rotation(
    conn: &mut PgConnection,
    family: &RefreshTokenFamily,
    expected_version: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE refresh_token_families \
         SET current_token_hash = $1, previous_token_hash = $2, last_seen_ip = $3, \
             last_rotated_at = $4, version = $5 \
         WHERE family_id = $6 AND version = $7 AND revoked = FALSE",
    )
    .bind(&family.current_token_hash)
    .bind(&family.previous_token_hash)
    .bind(&family.last_seen_ip)
    .bind(family.last_rotated_at)
    .bind(family.version)
    .bind(family.family_id)
    .bind(expected_version)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Marks one live family revoked. Revoked or past-ceiling families are left untouched.
pub async fn mark_revoked(
    conn: &mut PgConnection,
    family_id: FamilyId,
    reason: RevokeReason,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE refresh_token_families \
         SET revoked = TRUE, revoked_reason = $1, revoked_at = $2, version = version + 1 \
         WHERE family_id = $3 AND revoked = FALSE AND absolute_expires_at > $2",
    )
    .bind(reason)
    .bind(now)
    .bind(family_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn revoke_all_for_subject(
    pool: &PgPool,
    subject: &str,
    reason: RevokeReason,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE refresh_token_families \
         SET revoked = TRUE, revoked_reason = $1, revoked_at = $2, version = version + 1 \
         WHERE subject = $3 AND revoked = FALSE AND absolute_expires_at > $2",
    )
    .bind(reason)
    .bind(now)
    .bind(subject)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn list_for_subject(
    pool: &PgPool,
    subject: &str,
    now: DateTime<Utc>,
) -> Result<Vec<RefreshTokenFamily>, sqlx::Error> {
    let query = format!(
        "SELECT {} FROM refresh_token_families \
         WHERE subject = $1 AND absolute_expires_at > $2 \
         ORDER BY last_rotated_at DESC, issued_at DESC",
        FAMILY_COLUMNS
    );
    sqlx::query_as::<_, RefreshTokenFamily>(&query)
        .bind(subject)
        .bind(now)
        .fetch_all(pool)
        .await
}

/// Removes families past their absolute ceiling, revoked or not.
pub async fn delete_expired(pool: &PgPool, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM refresh_token_families WHERE absolute_expires_at <= $1")
        .bind(now)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
