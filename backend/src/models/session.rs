//! Models for refresh-token families (one per login session).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use utoipa::ToSchema;

use crate::types::FamilyId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
/// Why a family stopped being usable.
pub enum RevokeReason {
    Logout,
    LogoutAll,
    PasswordChanged,
    ReplayDetected,
    Tampered,
    SessionRevoked,
}

impl RevokeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevokeReason::Logout => "logout",
            RevokeReason::LogoutAll => "logout_all",
            RevokeReason::PasswordChanged => "password_changed",
            RevokeReason::ReplayDetected => "replay_detected",
            RevokeReason::Tampered => "tampered",
            RevokeReason::SessionRevoked => "session_revoked",
        }
    }
}

impl FromStr for RevokeReason {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "logout" => Ok(RevokeReason::Logout),
            "logout_all" => Ok(RevokeReason::LogoutAll),
            "password_changed" => Ok(RevokeReason::PasswordChanged),
            "replay_detected" => Ok(RevokeReason::ReplayDetected),
            "tampered" => Ok(RevokeReason::Tampered),
            "session_revoked" => Ok(RevokeReason::SessionRevoked),
            other => Err(anyhow::anyhow!("Unknown revoke reason: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
/// Lifecycle state of a family. Rotation is transient and folds back into `Active`.
pub enum FamilyState {
    Active,
    Revoked,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
/// Persisted state of one refresh-token family.
pub struct RefreshTokenFamily {
    pub family_id: FamilyId,
    /// Stable identifier of the authenticated principal.
    pub subject: String,
    #[serde(skip_serializing)]
    pub current_token_hash: String,
    #[serde(skip_serializing)]
    pub previous_token_hash: Option<String>,
    #[serde(skip_serializing)]
    pub device_fingerprint: String,
    pub issuing_ip: String,
    pub last_seen_ip: String,
    /// Authentication method that created the family (`pwd`, or a social provider name).
    pub provider: String,
    pub issued_at: DateTime<Utc>,
    pub last_rotated_at: DateTime<Utc>,
    /// Hard ceiling; rotation never moves it.
    pub absolute_expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_reason: Option<RevokeReason>,
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub version: i64,
}

impl RefreshTokenFamily {
    pub fn state(&self, now: DateTime<Utc>) -> FamilyState {
        if self.revoked {
            FamilyState::Revoked
        } else if self.absolute_expires_at <= now {
            FamilyState::Expired
        } else {
            FamilyState::Active
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == FamilyState::Active
    }
}
