//! Models that represent accounts and authentication payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use validator::Validate;

use crate::{models::session::RefreshTokenFamily, types::FamilyId};

#[derive(Debug, Clone, FromRow)]
/// Database representation of a password account.
pub struct User {
    /// Login identifier and token subject.
    pub email: String,
    /// Argon2 PHC string.
    pub password_hash: String,
    pub roles: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// An authenticated principal as seen by token issuance.
pub struct Principal {
    pub subject: String,
    pub roles: Vec<String>,
}

impl From<User> for Principal {
    fn from(user: User) -> Self {
        Self {
            subject: user.email,
            roles: user.roles,
        }
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct LoginRequest {
    #[validate(length(min = 1, max = 320))]
    pub email: String,
    #[validate(length(min = 1, max = 1024))]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
/// Body returned by login and refresh; the refresh token travels only in the cookie.
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    /// Seconds until the access token expires.
    pub expires_in: i64,
    pub subject: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ChangePasswordRequest {
    #[validate(length(min = 1))]
    pub current_password: String,
    #[validate(length(min = 8, max = 1024))]
    pub new_password: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
/// A login session as shown to its owner.
pub struct SessionResponse {
    pub family_id: FamilyId,
    pub provider: String,
    pub issuing_ip: String,
    pub last_seen_ip: String,
    pub issued_at: DateTime<Utc>,
    pub last_rotated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub is_current: bool,
}

impl SessionResponse {
    pub fn from_family(family: RefreshTokenFamily, current: Option<FamilyId>) -> Self {
        Self {
            is_current: current == Some(family.family_id),
            family_id: family.family_id,
            provider: family.provider,
            issuing_ip: family.issuing_ip,
            last_seen_ip: family.last_seen_ip,
            issued_at: family.issued_at,
            last_rotated_at: family.last_rotated_at,
            expires_at: family.absolute_expires_at,
            revoked: family.revoked,
        }
    }
}
