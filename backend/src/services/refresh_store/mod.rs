//! Persistence of refresh-token families.
//!
//! Every backend implements [`RefreshTokenStore`] with the same observable
//! semantics. Rotation is a single atomic compare-and-swap: a presented token
//! hash is classified against the stored family and, when it matches the
//! current hash, the family advances in the same critical section. Backends
//! that evaluate in Rust share [`classify`] and [`apply_rotation`]; the Redis
//! backend mirrors them in a server-side script.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{Config, SessionStoreBackend};
use crate::db::{connection::DbPool, redis::RedisPool};
use crate::models::session::{RefreshTokenFamily, RevokeReason};
use crate::types::FamilyId;

pub mod memory;
pub mod postgres;
pub mod redis;

pub use memory::InMemoryRefreshTokenStore;
pub use postgres::PgRefreshTokenStore;
pub use redis::RedisRefreshTokenStore;

/// Everything needed to open a new family. Hashes only; raw secrets never reach a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFamily {
    pub subject: String,
    pub provider: String,
    pub token_hash: String,
    pub device_fingerprint: String,
    pub ip: String,
    pub absolute_expires_at: DateTime<Utc>,
}

impl NewFamily {
    pub fn into_family(self, now: DateTime<Utc>) -> RefreshTokenFamily {
        RefreshTokenFamily {
            family_id: FamilyId::new(),
            subject: self.subject,
            current_token_hash: self.token_hash,
            previous_token_hash: None,
            device_fingerprint: self.device_fingerprint,
            issuing_ip: self.ip.clone(),
            last_seen_ip: self.ip,
            provider: self.provider,
            issued_at: now,
            last_rotated_at: now,
            absolute_expires_at: self.absolute_expires_at,
            revoked: false,
            revoked_reason: None,
            revoked_at: None,
            version: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationRequest {
    pub family_id: FamilyId,
    pub presented_hash: String,
    /// Hash of the secret that becomes current if the rotation goes through.
    pub next_hash: String,
    pub device_fingerprint: String,
    pub ip: String,
    pub hold_on_device_mismatch: bool,
    pub hold_on_ip_mismatch: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Anomalies {
    pub device_mismatch: bool,
    pub ip_mismatch: bool,
}

impl Anomalies {
    pub fn any(&self) -> bool {
        self.device_mismatch || self.ip_mismatch
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// The family advanced; `family` is the post-rotation state.
    Rotated {
        family: RefreshTokenFamily,
        anomalies: Anomalies,
    },
    /// The token was current but a mismatch configured to reject was observed.
    /// Nothing was written.
    Held {
        family: RefreshTokenFamily,
        anomalies: Anomalies,
    },
    /// A superseded token came back; the family is now revoked.
    ReplayDetected { family: RefreshTokenFamily },
    /// An active family was presented a hash it never issued; the family is now revoked.
    Tampered { family: RefreshTokenFamily },
    /// Missing, revoked or expired family. Nothing was written.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Rotate(Anomalies),
    Hold(Anomalies),
    Replay,
    Tampered,
    Unknown,
}

pub fn classify(
    family: Option<&RefreshTokenFamily>,
    request: &RotationRequest,
    now: DateTime<Utc>,
) -> Verdict {
    let Some(family) = family.filter(|family| family.is_active(now)) else {
        return Verdict::Unknown;
    };

    if family.current_token_hash == request.presented_hash {
        let anomalies = Anomalies {
            device_mismatch: family.device_fingerprint != request.device_fingerprint,
            ip_mismatch: family.last_seen_ip != request.ip,
        };
        let held = (anomalies.device_mismatch && request.hold_on_device_mismatch)
            || (anomalies.ip_mismatch && request.hold_on_ip_mismatch);
        if held {
            Verdict::Hold(anomalies)
        } else {
            Verdict::Rotate(anomalies)
        }
    } else if family.previous_token_hash.as_deref() == Some(request.presented_hash.as_str()) {
        Verdict::Replay
    } else {
        Verdict::Tampered
    }
}

pub fn apply_rotation(family: &mut RefreshTokenFamily, request: &RotationRequest, now: DateTime<Utc>) {
    let superseded = std::mem::replace(&mut family.current_token_hash, request.next_hash.clone());
    family.previous_token_hash = Some(superseded);
    family.last_seen_ip = request.ip.clone();
    family.last_rotated_at = now;
    family.version += 1;
}

/// Returns `false` when the family was already revoked.
pub fn apply_revocation(
    family: &mut RefreshTokenFamily,
    reason: RevokeReason,
    now: DateTime<Utc>,
) -> bool {
    if family.revoked {
        return false;
    }
    family.revoked = true;
    family.revoked_reason = Some(reason);
    family.revoked_at = Some(now);
    family.version += 1;
    true
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn create(&self, family: NewFamily) -> anyhow::Result<RefreshTokenFamily>;

    /// Classifies the presented hash and, for the current hash, rotates atomically.
    /// Replay and tamper outcomes revoke the family inside the same atomic step.
    async fn try_rotate(&self, request: RotationRequest) -> anyhow::Result<RotationOutcome>;

    /// Idempotent; `Ok(false)` for missing or already-revoked families.
    async fn revoke_family(&self, family_id: FamilyId, reason: RevokeReason)
        -> anyhow::Result<bool>;

    /// Revokes every non-expired family owned by `subject`, returning how many changed.
    async fn revoke_all_for_subject(&self, subject: &str, reason: RevokeReason)
        -> anyhow::Result<u64>;

    async fn find_family(&self, family_id: FamilyId) -> anyhow::Result<Option<RefreshTokenFamily>>;

    /// Families of `subject` that have not yet reached their absolute ceiling.
    async fn list_families_for_subject(&self, subject: &str)
        -> anyhow::Result<Vec<RefreshTokenFamily>>;

    /// Deletes families past their absolute ceiling.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> anyhow::Result<u64>;
}

pub fn build_refresh_store(
    config: &Config,
    pool: Option<DbPool>,
    redis: Option<RedisPool>,
) -> anyhow::Result<Arc<dyn RefreshTokenStore>> {
    let store: Arc<dyn RefreshTokenStore> = match config.session_store_backend {
        SessionStoreBackend::Memory => Arc::new(InMemoryRefreshTokenStore::new()),
        SessionStoreBackend::Postgres => {
            let pool = pool
                .ok_or_else(|| anyhow::anyhow!("Postgres session store requires a database pool"))?;
            Arc::new(PgRefreshTokenStore::new(pool))
        }
        SessionStoreBackend::Redis => {
            let redis = redis
                .ok_or_else(|| anyhow::anyhow!("Redis session store requires REDIS_URL"))?;
            Arc::new(RedisRefreshTokenStore::new(redis))
        }
    };
    tracing::info!(backend = ?config.session_store_backend, "Refresh token store ready");
    Ok(store)
}
