//! Refresh-token rotation and replay detection.
//!
//! The engine owns the family lifecycle: it opens a family at login, redeems
//! refresh tokens through the store's atomic rotation, turns store outcomes
//! into [`AuthError`]s, and mints the access/refresh token pair on success.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::config::{Config, MismatchPolicy};
use crate::error::AuthError;
use crate::models::session::{RefreshTokenFamily, RevokeReason};
use crate::services::credentials::CredentialVerifier;
use crate::services::refresh_store::{
    Anomalies, NewFamily, RefreshTokenStore, RotationOutcome, RotationRequest,
};
use crate::types::FamilyId;
use crate::utils::client::ClientContext;
use crate::utils::jwt::{generate_token_secret, hash_token_secret, Claims, TokenCodec, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub access_ttl: Duration,
    pub absolute_ttl: Duration,
    pub idle_ttl: Duration,
    pub device_mismatch: MismatchPolicy,
    pub ip_mismatch: MismatchPolicy,
}

impl RotationPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            access_ttl: config.access_token_ttl(),
            absolute_ttl: config.refresh_absolute_ttl(),
            idle_ttl: config.refresh_idle_ttl(),
            device_mismatch: config.refresh_device_mismatch_policy,
            ip_mismatch: config.refresh_ip_mismatch_policy,
        }
    }

    /// Each refresh token slides forward by the idle window but never past the family ceiling.
    pub fn refresh_expiry(&self, now: DateTime<Utc>, absolute_expires_at: DateTime<Utc>) -> DateTime<Utc> {
        (now + self.idle_ttl).min(absolute_expires_at)
    }
}

/// Token pair handed to the transport after a login or a successful refresh.
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub access_token: String,
    pub access_expires_in: i64,
    pub refresh_token: String,
    pub subject: String,
    pub roles: Vec<String>,
    pub family: RefreshTokenFamily,
}

pub struct RotationEngine {
    store: Arc<dyn RefreshTokenStore>,
    credentials: Arc<dyn CredentialVerifier>,
    codec: TokenCodec,
    policy: RotationPolicy,
}

impl RotationEngine {
    pub fn new(
        store: Arc<dyn RefreshTokenStore>,
        credentials: Arc<dyn CredentialVerifier>,
        codec: TokenCodec,
        policy: RotationPolicy,
    ) -> Self {
        Self {
            store,
            credentials,
            codec,
            policy,
        }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    /// Opens a new family for an authenticated principal.
    pub async fn start_family(
        &self,
        subject: &str,
        provider: &str,
        roles: Vec<String>,
        ctx: &ClientContext,
    ) -> Result<IssuedTokens, AuthError> {
        let now = Utc::now();
        let secret = generate_token_secret();
        let family = self
            .store
            .create(NewFamily {
                subject: subject.to_string(),
                provider: provider.to_string(),
                token_hash: hash_token_secret(&secret),
                device_fingerprint: ctx.fingerprint(),
                ip: ctx.ip.clone(),
                absolute_expires_at: now + self.policy.absolute_ttl,
            })
            .await
            .map_err(AuthError::Store)?;

        tracing::info!(
            family_id = %family.family_id,
            subject = %family.subject,
            provider = %family.provider,
            "Refresh token family created"
        );
        self.mint(family, secret, roles, now)
    }

    /// Redeems a refresh token: verify, check linkage and binding, rotate atomically.
    pub async fn refresh(
        &self,
        presented: &str,
        access_token: Option<&str>,
        ctx: &ClientContext,
    ) -> Result<IssuedTokens, AuthError> {
        let claims = self.codec.verify(presented)?;
        if claims.typ != TokenKind::Refresh {
            return Err(AuthError::InvalidTokenType);
        }
        let (family_id, secret) = refresh_linkage(&claims)?;

        if let Some(bound_subject) = access_token.and_then(|token| self.access_subject(token)) {
            if bound_subject != claims.sub {
                tracing::warn!(
                    target: "security",
                    family_id = %family_id,
                    "Access and refresh tokens presented together belong to different subjects"
                );
                return Err(AuthError::RefreshBindingMismatch);
            }
        }

        // Must happen before the rotation commits.
        let roles = self
            .credentials
            .roles_for(&claims.sub)
            .await
            .map_err(AuthError::Store)?;

        let next_secret = generate_token_secret();
        let request = RotationRequest {
            family_id,
            presented_hash: hash_token_secret(secret),
            next_hash: hash_token_secret(&next_secret),
            device_fingerprint: ctx.fingerprint(),
            ip: ctx.ip.clone(),
            hold_on_device_mismatch: self.policy.device_mismatch.rejects(),
            hold_on_ip_mismatch: self.policy.ip_mismatch.rejects(),
        };

        let outcome = self
            .store
            .try_rotate(request)
            .await
            .map_err(AuthError::Store)?;

        match outcome {
            RotationOutcome::Rotated { family, anomalies } => {
                if anomalies.any() {
                    log_anomalies(&family, &anomalies, ctx, "allowed by policy");
                }
                tracing::debug!(family_id = %family.family_id, "Refresh token rotated");
                self.mint(family, next_secret, roles, Utc::now())
            }
            RotationOutcome::Held { family, anomalies } => {
                log_anomalies(&family, &anomalies, ctx, "rotation refused");
                if anomalies.device_mismatch && self.policy.device_mismatch.rejects() {
                    Err(AuthError::RefreshDeviceMismatch)
                } else {
                    Err(AuthError::RefreshIpMismatch)
                }
            }
            RotationOutcome::ReplayDetected { family } => {
                tracing::error!(
                    target: "security",
                    family_id = %family.family_id,
                    subject = %family.subject,
                    ip = %ctx.ip,
                    "Refresh token replay detected; family revoked"
                );
                Err(AuthError::RefreshReplayDetected)
            }
            RotationOutcome::Tampered { family } => {
                tracing::error!(
                    target: "security",
                    family_id = %family.family_id,
                    subject = %family.subject,
                    ip = %ctx.ip,
                    "Refresh token does not match any issued value; family revoked"
                );
                Err(AuthError::RefreshTampered)
            }
            RotationOutcome::Unknown => {
                tracing::info!(family_id = %family_id, "Refresh attempted on unknown or ended family");
                Err(AuthError::UnknownRefresh)
            }
        }
    }

    pub async fn revoke(&self, family_id: FamilyId, reason: RevokeReason) -> Result<bool, AuthError> {
        let revoked = self
            .store
            .revoke_family(family_id, reason)
            .await
            .map_err(AuthError::Store)?;
        if revoked {
            tracing::info!(family_id = %family_id, reason = reason.as_str(), "Refresh token family revoked");
        }
        Ok(revoked)
    }

    pub async fn revoke_all_for_subject(
        &self,
        subject: &str,
        reason: RevokeReason,
    ) -> Result<u64, AuthError> {
        let revoked = self
            .store
            .revoke_all_for_subject(subject, reason)
            .await
            .map_err(AuthError::Store)?;
        tracing::info!(
            subject = %subject,
            reason = reason.as_str(),
            revoked,
            "Revoked all refresh token families for subject"
        );
        Ok(revoked)
    }

    pub async fn find_family(&self, family_id: FamilyId) -> Result<Option<RefreshTokenFamily>, AuthError> {
        self.store
            .find_family(family_id)
            .await
            .map_err(AuthError::Store)
    }

    pub async fn list_families(&self, subject: &str) -> Result<Vec<RefreshTokenFamily>, AuthError> {
        self.store
            .list_families_for_subject(subject)
            .await
            .map_err(AuthError::Store)
    }

    /// Family id carried by a refresh token whose signature checks out, expired or not.
    pub fn family_id_from_token(&self, token: &str) -> Option<FamilyId> {
        let claims = self.codec.verify_ignoring_expiry(token).ok()?;
        if claims.typ != TokenKind::Refresh {
            return None;
        }
        claims.fid.as_deref()?.parse().ok()
    }

    fn access_subject(&self, token: &str) -> Option<String> {
        match self.codec.verify_ignoring_expiry(token) {
            Ok(claims) if claims.typ == TokenKind::Access => Some(claims.sub),
            Ok(_) => None,
            Err(err) => {
                tracing::debug!(error = %err, "Ignoring unverifiable access token on refresh");
                None
            }
        }
    }

    fn mint(
        &self,
        family: RefreshTokenFamily,
        secret: String,
        roles: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<IssuedTokens, AuthError> {
        let access_claims = Claims::access(
            family.subject.clone(),
            roles.clone(),
            family.provider.clone(),
            family.issued_at,
            self.policy.access_ttl,
        );
        let access_token = self.codec.sign(&access_claims).map_err(AuthError::Store)?;

        let refresh_claims = Claims::refresh(
            family.subject.clone(),
            family.family_id,
            secret,
            self.policy.refresh_expiry(now, family.absolute_expires_at),
        );
        let refresh_token = self.codec.sign(&refresh_claims).map_err(AuthError::Store)?;

        Ok(IssuedTokens {
            access_token,
            access_expires_in: self.policy.access_ttl.num_seconds(),
            refresh_token,
            subject: family.subject.clone(),
            roles,
            family,
        })
    }
}

fn refresh_linkage(claims: &Claims) -> Result<(FamilyId, &str), AuthError> {
    let family_id = claims
        .fid
        .as_deref()
        .and_then(|raw| raw.parse::<FamilyId>().ok())
        .ok_or(AuthError::InvalidRefreshClaims)?;
    let secret = claims
        .tok
        .as_deref()
        .filter(|secret| !secret.is_empty())
        .ok_or(AuthError::InvalidRefreshClaims)?;
    Ok((family_id, secret))
}

fn log_anomalies(family: &RefreshTokenFamily, anomalies: &Anomalies, ctx: &ClientContext, action: &str) {
    if anomalies.device_mismatch {
        tracing::warn!(
            target: "security",
            family_id = %family.family_id,
            subject = %family.subject,
            action,
            "Refresh token presented from a different device"
        );
    }
    if anomalies.ip_mismatch {
        tracing::warn!(
            target: "security",
            family_id = %family.family_id,
            subject = %family.subject,
            last_seen_ip = %family.last_seen_ip,
            ip = %ctx.ip,
            action,
            "Refresh token presented from a different IP address"
        );
    }
}
