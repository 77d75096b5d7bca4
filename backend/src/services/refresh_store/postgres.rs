use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::Instrument;

use super::{
    apply_revocation, apply_rotation, classify, NewFamily, RefreshTokenStore, RotationOutcome,
    RotationRequest, Verdict,
};
use crate::db::connection::DbPool;
use crate::models::session::{RefreshTokenFamily, RevokeReason};
use crate::repositories::refresh_family;
use crate::types::FamilyId;

/// Relational store. Rotation runs in one transaction holding a row lock on
/// the family, and the write is additionally guarded by the `version` column.
#[derive(Clone)]
pub struct PgRefreshTokenStore {
    pool: DbPool,
}

impl PgRefreshTokenStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    async fn create(&self, family: NewFamily) -> anyhow::Result<RefreshTokenFamily> {
        let family = family.into_family(Utc::now());
        let stored = refresh_family::insert_family(&self.pool, &family).await?;
        Ok(stored)
    }

    async fn try_rotate(&self, request: RotationRequest) -> anyhow::Result<RotationOutcome> {
        let span = tracing::debug_span!("pg_try_rotate", family_id = %request.family_id);
        async move {
            let mut tx = self.pool.begin().await?;
            let Some(mut family) = refresh_family::lock_family(&mut *tx, request.family_id).await?
            else {
                tx.rollback().await?;
                return Ok(RotationOutcome::Unknown);
            };

            let now = Utc::now();
            let outcome = match classify(Some(&family), &request, now) {
                Verdict::Unknown => {
                    tx.rollback().await?;
                    return Ok(RotationOutcome::Unknown);
                }
                Verdict::Hold(anomalies) => {
                    tx.rollback().await?;
                    return Ok(RotationOutcome::Held { family, anomalies });
                }
                Verdict::Rotate(anomalies) => {
                    let expected_version = family.version;
                    apply_rotation(&mut family, &request, now);
                    let written =
                        refresh_family::update_rotation(&mut *tx, &family, expected_version)
                            .await?;
                    if !written {
                        tx.rollback().await?;
                        anyhow::bail!(
                            "refresh family {} changed during rotation",
                            request.family_id
                        );
                    }
                    RotationOutcome::Rotated { family, anomalies }
                }
                Verdict::Replay => {
                    refresh_family::mark_revoked(
                        &mut *tx,
                        family.family_id,
                        RevokeReason::ReplayDetected,
                        now,
                    )
                    .await?;
                    apply_revocation(&mut family, RevokeReason::ReplayDetected, now);
                    RotationOutcome::ReplayDetected { family }
                }
                Verdict::Tampered => {
                    refresh_family::mark_revoked(
                        &mut *tx,
                        family.family_id,
                        RevokeReason::Tampered,
                        now,
                    )
                    .await?;
                    apply_revocation(&mut family, RevokeReason::Tampered, now);
                    RotationOutcome::Tampered { family }
                }
            };

            tx.commit().await?;
            Ok::<_, anyhow::Error>(outcome)
        }
        .instrument(span)
        .await
    }

    async fn revoke_family(
        &self,
        family_id: FamilyId,
        reason: RevokeReason,
    ) -> anyhow::Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let changed = refresh_family::mark_revoked(&mut *conn, family_id, reason, Utc::now()).await?;
        Ok(changed)
    }

    async fn revoke_all_for_subject(
        &self,
        subject: &str,
        reason: RevokeReason,
    ) -> anyhow::Result<u64> {
        let changed =
            refresh_family::revoke_all_for_subject(&self.pool, subject, reason, Utc::now()).await?;
        Ok(changed)
    }

    async fn find_family(&self, family_id: FamilyId) -> anyhow::Result<Option<RefreshTokenFamily>> {
        Ok(refresh_family::find_family(&self.pool, family_id).await?)
    }

    async fn list_families_for_subject(
        &self,
        subject: &str,
    ) -> anyhow::Result<Vec<RefreshTokenFamily>> {
        Ok(refresh_family::list_for_subject(&self.pool, subject, Utc::now()).await?)
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        Ok(refresh_family::delete_expired(&self.pool, now).await?)
    }
}
