//! Login, logout and account flows built on the rotation engine and the login guard.

use std::sync::Arc;

use crate::error::{AppError, AuthError};
use crate::models::session::RevokeReason;
use crate::models::user::{Principal, SessionResponse};
use crate::services::credentials::{normalize_subject, CredentialVerifier};
use crate::services::login_guard::LoginAttemptGuard;
use crate::services::rotation::{IssuedTokens, RotationEngine};
use crate::types::FamilyId;
use crate::utils::client::ClientContext;
use crate::utils::jwt::PASSWORD_AUTH_METHOD;
use crate::utils::password::check_new_password;

#[derive(Clone)]
pub struct SessionService {
    engine: Arc<RotationEngine>,
    guard: Arc<dyn LoginAttemptGuard>,
    credentials: Arc<dyn CredentialVerifier>,
}

impl SessionService {
    pub fn new(
        engine: Arc<RotationEngine>,
        guard: Arc<dyn LoginAttemptGuard>,
        credentials: Arc<dyn CredentialVerifier>,
    ) -> Self {
        Self {
            engine,
            guard,
            credentials,
        }
    }

    pub fn engine(&self) -> &RotationEngine {
        &self.engine
    }

    /// Password login. A locked account is refused before the password is
    /// looked at, with the same error as a wrong password.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        ctx: &ClientContext,
    ) -> Result<IssuedTokens, AuthError> {
        let principal = self.authenticate(&normalize_subject(email), password, ctx).await?;

        self.engine
            .start_family(&principal.subject, PASSWORD_AUTH_METHOD, principal.roles, ctx)
            .await
    }

    /// Entry point for identities already proven elsewhere (social login).
    pub async fn issue_session(
        &self,
        subject: &str,
        provider: &str,
        roles: Vec<String>,
        ctx: &ClientContext,
    ) -> Result<IssuedTokens, AuthError> {
        self.engine
            .start_family(&normalize_subject(subject), provider, roles, ctx)
            .await
    }

    pub async fn refresh(
        &self,
        refresh_token: Option<&str>,
        access_token: Option<&str>,
        ctx: &ClientContext,
    ) -> Result<IssuedTokens, AuthError> {
        let refresh_token = refresh_token.ok_or(AuthError::MissingRefreshToken)?;
        self.engine.refresh(refresh_token, access_token, ctx).await
    }

    /// Revokes the family behind the presented cookie, if it can be identified.
    pub async fn logout(&self, refresh_token: Option<&str>) -> Result<Option<FamilyId>, AuthError> {
        let Some(family_id) = refresh_token.and_then(|token| self.engine.family_id_from_token(token))
        else {
            return Ok(None);
        };
        self.engine.revoke(family_id, RevokeReason::Logout).await?;
        Ok(Some(family_id))
    }

    pub async fn logout_all(&self, subject: &str) -> Result<u64, AuthError> {
        self.engine
            .revoke_all_for_subject(subject, RevokeReason::LogoutAll)
            .await
    }

    /// Replaces the password and ends every session of the subject.
    pub async fn change_password(
        &self,
        subject: &str,
        current_password: &str,
        new_password: &str,
        ctx: &ClientContext,
    ) -> Result<u64, AppError> {
        check_new_password(current_password, new_password)
            .map_err(|message| AppError::BadRequest(message.to_string()))?;

        match self.authenticate(subject, current_password, ctx).await {
            Ok(_) => {}
            Err(AuthError::InvalidCredentials) => {
                return Err(AppError::BadRequest("Current password is incorrect".to_string()));
            }
            Err(err) => return Err(err.into()),
        }

        if !self.credentials.update_password(subject, new_password).await? {
            return Err(AppError::NotFound("Account not found".to_string()));
        }

        let revoked = self
            .engine
            .revoke_all_for_subject(subject, RevokeReason::PasswordChanged)
            .await?;
        tracing::info!(subject = %subject, revoked, "Password changed");
        Ok(revoked)
    }

    /// Every password check goes through the guard: locked subjects are
    /// refused unseen, failures are counted and a success clears the counter.
    async fn authenticate(
        &self,
        subject: &str,
        password: &str,
        ctx: &ClientContext,
    ) -> Result<Principal, AuthError> {
        if let Some(until) = self
            .guard
            .lock_status(subject)
            .await
            .map_err(AuthError::Store)?
        {
            tracing::warn!(
                target: "security",
                subject = %subject,
                locked_until = %until,
                ip = %ctx.ip,
                "Password check on locked account"
            );
            return Err(AuthError::InvalidCredentials);
        }

        let principal = self
            .credentials
            .verify(subject, password)
            .await
            .map_err(AuthError::Store)?;

        let Some(principal) = principal else {
            let state = self
                .guard
                .record_failure(subject)
                .await
                .map_err(AuthError::Store)?;
            if let Some(until) = state.locked_until {
                tracing::warn!(
                    target: "security",
                    subject = %subject,
                    locked_until = %until,
                    lockout_count = state.lockout_count,
                    ip = %ctx.ip,
                    "Account locked after repeated password failures"
                );
            } else {
                tracing::info!(
                    subject = %subject,
                    failed_count = state.failed_count,
                    "Password check failed"
                );
            }
            return Err(AuthError::InvalidCredentials);
        };

        self.guard
            .record_success(&principal.subject)
            .await
            .map_err(AuthError::Store)?;
        Ok(principal)
    }

    pub async fn list_sessions(
        &self,
        subject: &str,
        current: Option<FamilyId>,
    ) -> Result<Vec<SessionResponse>, AuthError> {
        let families = self.engine.list_families(subject).await?;
        Ok(families
            .into_iter()
            .map(|family| SessionResponse::from_family(family, current))
            .collect())
    }

    /// Revokes one of the subject's own families; anything else is reported as not found.
    pub async fn revoke_session(&self, subject: &str, family_id: FamilyId) -> Result<(), AppError> {
        match self.engine.find_family(family_id).await? {
            Some(family) if family.subject == subject => {
                self.engine
                    .revoke(family_id, RevokeReason::SessionRevoked)
                    .await?;
                Ok(())
            }
            _ => Err(AppError::NotFound("Session not found".to_string())),
        }
    }
}
