use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{LockoutPolicy, LoginAttemptGuard};
use crate::db::connection::DbPool;
use crate::models::login_attempt::LoginAttemptState;
use crate::repositories::login_attempt;

/// Counter rows live in `login_attempts`; each failure is evaluated under a row lock.
#[derive(Clone)]
pub struct PgLoginAttemptGuard {
    pool: DbPool,
    policy: LockoutPolicy,
}

impl PgLoginAttemptGuard {
    pub fn new(pool: DbPool, policy: LockoutPolicy) -> Self {
        Self { pool, policy }
    }
}

#[async_trait]
impl LoginAttemptGuard for PgLoginAttemptGuard {
    async fn lock_status(&self, subject: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        let state = login_attempt::find_attempts(&self.pool, subject).await?;
        Ok(state.and_then(|state| state.locked_at(Utc::now())))
    }

    async fn record_failure(&self, subject: &str) -> anyhow::Result<LoginAttemptState> {
        let mut tx = self.pool.begin().await?;
        let current = login_attempt::lock_attempts(&mut *tx, subject).await?;
        let now = Utc::now();
        let next = self.policy.apply_failure(&current, now);
        if next != current {
            login_attempt::save_attempts(&mut *tx, subject, &next, now).await?;
        }
        tx.commit().await?;
        Ok(next)
    }

    async fn record_success(&self, subject: &str) -> anyhow::Result<()> {
        login_attempt::delete_attempts(&self.pool, subject).await?;
        Ok(())
    }
}
