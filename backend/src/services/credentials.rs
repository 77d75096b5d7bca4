//! Password verification and role lookup for local accounts.

use std::sync::OnceLock;

use async_trait::async_trait;

use crate::db::connection::DbPool;
use crate::models::user::Principal;
use crate::repositories::user as user_repo;
use crate::utils::password::{hash_password, verify_password};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// `Ok(None)` for an unknown subject or a wrong password; callers must not tell them apart.
    async fn verify(&self, subject: &str, password: &str) -> anyhow::Result<Option<Principal>>;

    /// Current roles for access-token minting. Subjects without a local account have none.
    async fn roles_for(&self, subject: &str) -> anyhow::Result<Vec<String>>;

    async fn update_password(&self, subject: &str, new_password: &str) -> anyhow::Result<bool>;
}

#[derive(Clone)]
pub struct PgCredentialVerifier {
    pool: DbPool,
}

impl PgCredentialVerifier {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialVerifier for PgCredentialVerifier {
    async fn verify(&self, subject: &str, password: &str) -> anyhow::Result<Option<Principal>> {
        let Some(user) = user_repo::find_by_email(&self.pool, subject).await? else {
            // Same argon2 cost as a real account.
            if let Some(hash) = dummy_hash() {
                let _ = verify_password(password, hash);
            }
            return Ok(None);
        };
        if verify_password(password, &user.password_hash)? {
            Ok(Some(Principal::from(user)))
        } else {
            Ok(None)
        }
    }

    async fn roles_for(&self, subject: &str) -> anyhow::Result<Vec<String>> {
        Ok(user_repo::find_by_email(&self.pool, subject)
            .await?
            .map(|user| user.roles)
            .unwrap_or_default())
    }

    async fn update_password(&self, subject: &str, new_password: &str) -> anyhow::Result<bool> {
        let hash = hash_password(new_password)?;
        Ok(user_repo::update_password_hash(&self.pool, subject, &hash).await?)
    }
}

const DUMMY_PASSWORD: &str = "sessionguard-unknown-account";

/// Hash checked for unknown subjects, computed once with the live argon2 parameters.
fn dummy_hash() -> Option<&'static str> {
    static DUMMY_HASH: OnceLock<Option<String>> = OnceLock::new();
    DUMMY_HASH
        .get_or_init(|| hash_password(DUMMY_PASSWORD).ok())
        .as_deref()
}

/// Canonical form of a login identifier.
pub fn normalize_subject(raw: &str) -> String {
    raw.trim().to_lowercase()
}
