use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    apply_revocation, apply_rotation, classify, NewFamily, RefreshTokenStore, RotationOutcome,
    RotationRequest, Verdict,
};
use crate::models::session::{RefreshTokenFamily, RevokeReason};
use crate::types::FamilyId;

/// Single-process store. One lock guards the whole map, so every operation is atomic.
#[derive(Debug, Default)]
pub struct InMemoryRefreshTokenStore {
    families: Mutex<HashMap<FamilyId, RefreshTokenFamily>>,
}

impl InMemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_families<T>(&self, f: impl FnOnce(&mut HashMap<FamilyId, RefreshTokenFamily>) -> T) -> T {
        let mut families = self.families.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut families)
    }
}

#[async_trait]
impl RefreshTokenStore for InMemoryRefreshTokenStore {
    async fn create(&self, family: NewFamily) -> anyhow::Result<RefreshTokenFamily> {
        let family = family.into_family(Utc::now());
        self.with_families(|families| {
            families.insert(family.family_id, family.clone());
        });
        Ok(family)
    }

    async fn try_rotate(&self, request: RotationRequest) -> anyhow::Result<RotationOutcome> {
        let now = Utc::now();
        let outcome = self.with_families(|families| {
            let Some(family) = families.get_mut(&request.family_id) else {
                return RotationOutcome::Unknown;
            };
            match classify(Some(&*family), &request, now) {
                Verdict::Rotate(anomalies) => {
                    apply_rotation(family, &request, now);
                    RotationOutcome::Rotated {
                        family: family.clone(),
                        anomalies,
                    }
                }
                Verdict::Hold(anomalies) => RotationOutcome::Held {
                    family: family.clone(),
                    anomalies,
                },
                Verdict::Replay => {
                    apply_revocation(family, RevokeReason::ReplayDetected, now);
                    RotationOutcome::ReplayDetected {
                        family: family.clone(),
                    }
                }
                Verdict::Tampered => {
                    apply_revocation(family, RevokeReason::Tampered, now);
                    RotationOutcome::Tampered {
                        family: family.clone(),
                    }
                }
                Verdict::Unknown => RotationOutcome::Unknown,
            }
        });
        Ok(outcome)
    }

    async fn revoke_family(
        &self,
        family_id: FamilyId,
        reason: RevokeReason,
    ) -> anyhow::Result<bool> {
        let now = Utc::now();
        Ok(self.with_families(|families| {
            families
                .get_mut(&family_id)
                .filter(|family| family.absolute_expires_at > now)
                .map(|family| apply_revocation(family, reason, now))
                .unwrap_or(false)
        }))
    }

    async fn revoke_all_for_subject(
        &self,
        subject: &str,
        reason: RevokeReason,
    ) -> anyhow::Result<u64> {
        let now = Utc::now();
        Ok(self.with_families(|families| {
            families
                .values_mut()
                .filter(|family| family.subject == subject && family.absolute_expires_at > now)
                .map(|family| apply_revocation(family, reason, now))
                .filter(|changed| *changed)
                .count() as u64
        }))
    }

    async fn find_family(&self, family_id: FamilyId) -> anyhow::Result<Option<RefreshTokenFamily>> {
        Ok(self.with_families(|families| families.get(&family_id).cloned()))
    }

    async fn list_families_for_subject(
        &self,
        subject: &str,
    ) -> anyhow::Result<Vec<RefreshTokenFamily>> {
        let now = Utc::now();
        let mut listed: Vec<RefreshTokenFamily> = self.with_families(|families| {
            families
                .values()
                .filter(|family| family.subject == subject && family.absolute_expires_at > now)
                .cloned()
                .collect()
        });
        listed.sort_by(|a, b| b.last_rotated_at.cmp(&a.last_rotated_at));
        Ok(listed)
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        Ok(self.with_families(|families| {
            let before = families.len();
            families.retain(|_, family| family.absolute_expires_at > now);
            (before - families.len()) as u64
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_family(subject: &str, hash: &str) -> NewFamily {
        NewFamily {
            subject: subject.into(),
            provider: "pwd".into(),
            token_hash: hash.into(),
            device_fingerprint: "fp".into(),
            ip: "10.0.0.1".into(),
            absolute_expires_at: Utc::now() + Duration::days(1),
        }
    }

    fn rotation(family_id: FamilyId, presented: &str, next: &str) -> RotationRequest {
        RotationRequest {
            family_id,
            presented_hash: presented.into(),
            next_hash: next.into(),
            device_fingerprint: "fp".into(),
            ip: "10.0.0.1".into(),
            hold_on_device_mismatch: true,
            hold_on_ip_mismatch: true,
        }
    }

    #[tokio::test]
    async fn replay_revokes_the_family() {
        let store = InMemoryRefreshTokenStore::new();
        let family = store.create(new_family("u1", "h0")).await.unwrap();

        let first = store
            .try_rotate(rotation(family.family_id, "h0", "h1"))
            .await
            .unwrap();
        assert!(matches!(first, RotationOutcome::Rotated { .. }));

        let replay = store
            .try_rotate(rotation(family.family_id, "h0", "h2"))
            .await
            .unwrap();
        assert!(matches!(replay, RotationOutcome::ReplayDetected { .. }));

        let after = store
            .try_rotate(rotation(family.family_id, "h1", "h3"))
            .await
            .unwrap();
        assert_eq!(after, RotationOutcome::Unknown);

        let stored = store.find_family(family.family_id).await.unwrap().unwrap();
        assert_eq!(stored.revoked_reason, Some(RevokeReason::ReplayDetected));
    }

    #[tokio::test]
    async fn held_rotation_leaves_state_untouched() {
        let store = InMemoryRefreshTokenStore::new();
        let family = store.create(new_family("u1", "h0")).await.unwrap();

        let mut request = rotation(family.family_id, "h0", "h1");
        request.device_fingerprint = "elsewhere".into();
        let outcome = store.try_rotate(request).await.unwrap();
        assert!(matches!(outcome, RotationOutcome::Held { .. }));

        let stored = store.find_family(family.family_id).await.unwrap().unwrap();
        assert_eq!(stored, family);
    }

    #[tokio::test]
    async fn revoke_all_skips_other_subjects() {
        let store = InMemoryRefreshTokenStore::new();
        store.create(new_family("u1", "a")).await.unwrap();
        store.create(new_family("u1", "b")).await.unwrap();
        let other = store.create(new_family("u2", "c")).await.unwrap();

        let revoked = store
            .revoke_all_for_subject("u1", RevokeReason::LogoutAll)
            .await
            .unwrap();
        assert_eq!(revoked, 2);
        assert_eq!(
            store
                .revoke_all_for_subject("u1", RevokeReason::LogoutAll)
                .await
                .unwrap(),
            0
        );
        assert!(!store.find_family(other.family_id).await.unwrap().unwrap().revoked);
    }

    #[tokio::test]
    async fn sweep_drops_only_expired_families() {
        let store = InMemoryRefreshTokenStore::new();
        let live = store.create(new_family("u1", "a")).await.unwrap();
        let mut stale = new_family("u1", "b");
        stale.absolute_expires_at = Utc::now() - Duration::seconds(1);
        let stale = store.create(stale).await.unwrap();

        assert_eq!(store.sweep_expired(Utc::now()).await.unwrap(), 1);
        assert!(store.find_family(stale.family_id).await.unwrap().is_none());
        assert!(store.find_family(live.family_id).await.unwrap().is_some());
    }
}
