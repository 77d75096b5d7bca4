//! Per-subject consecutive-failure counting and temporary account lockout.
//!
//! The guard answers "is this subject locked right now", records failed and
//! successful attempts, and applies [`LockoutPolicy`]. While locked, further
//! failures are not counted. A success clears all state for the subject.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::config::{Config, SessionStoreBackend};
use crate::db::{connection::DbPool, redis::RedisPool};
use crate::models::login_attempt::LoginAttemptState;

pub mod memory;
pub mod postgres;
pub mod redis;

pub use memory::InMemoryLoginAttemptGuard;
pub use postgres::PgLoginAttemptGuard;
pub use redis::RedisLoginAttemptGuard;

const MAX_BACKOFF_EXPONENT: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    pub threshold: u32,
    pub base_duration: Duration,
    pub max_duration: Duration,
    pub backoff: bool,
}

impl LockoutPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            threshold: config.account_lockout_threshold.max(1),
            base_duration: Duration::minutes(config.account_lockout_duration_minutes.max(1) as i64),
            max_duration: Duration::hours(config.account_lockout_max_duration_hours.max(1) as i64),
            backoff: config.account_lockout_backoff_enabled,
        }
    }

    /// Length of the `lockout_count`-th lock (1-based).
    pub fn lock_duration(&self, lockout_count: i32) -> Duration {
        let base = self.base_duration.num_seconds().max(1);
        let seconds = if self.backoff {
            let exponent = (lockout_count.max(1) as u32 - 1).min(MAX_BACKOFF_EXPONENT);
            base.saturating_mul(1_i64 << exponent)
        } else {
            base
        };
        Duration::seconds(seconds.min(self.max_duration.num_seconds()))
    }

    pub fn apply_failure(&self, state: &LoginAttemptState, now: DateTime<Utc>) -> LoginAttemptState {
        if state.locked_at(now).is_some() {
            return state.clone();
        }

        let failed_count = state.failed_count.saturating_add(1);
        if failed_count as i64 >= self.threshold as i64 {
            let lockout_count = state.lockout_count.saturating_add(1);
            LoginAttemptState {
                failed_count: 0,
                locked_until: Some(now + self.lock_duration(lockout_count)),
                lockout_count,
            }
        } else {
            LoginAttemptState {
                failed_count,
                locked_until: None,
                lockout_count: state.lockout_count,
            }
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LoginAttemptGuard: Send + Sync {
    /// End of the active lock, if any.
    async fn lock_status(&self, subject: &str) -> anyhow::Result<Option<DateTime<Utc>>>;

    /// Counts one failed attempt and returns the resulting state.
    async fn record_failure(&self, subject: &str) -> anyhow::Result<LoginAttemptState>;

    async fn record_success(&self, subject: &str) -> anyhow::Result<()>;
}

pub fn build_login_guard(
    config: &Config,
    pool: Option<DbPool>,
    redis: Option<RedisPool>,
) -> anyhow::Result<Arc<dyn LoginAttemptGuard>> {
    let policy = LockoutPolicy::from_config(config);
    let guard: Arc<dyn LoginAttemptGuard> = match config.session_store_backend {
        SessionStoreBackend::Memory => Arc::new(InMemoryLoginAttemptGuard::new(policy)),
        SessionStoreBackend::Postgres => {
            let pool = pool
                .ok_or_else(|| anyhow::anyhow!("Postgres login guard requires a database pool"))?;
            Arc::new(PgLoginAttemptGuard::new(pool, policy))
        }
        SessionStoreBackend::Redis => {
            let redis =
                redis.ok_or_else(|| anyhow::anyhow!("Redis login guard requires REDIS_URL"))?;
            Arc::new(RedisLoginAttemptGuard::new(redis, policy))
        }
    };
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(backoff: bool) -> LockoutPolicy {
        LockoutPolicy {
            threshold: 5,
            base_duration: Duration::minutes(15),
            max_duration: Duration::hours(24),
            backoff,
        }
    }

    #[test]
    fn fifth_failure_locks_and_resets_counter() {
        let now = Utc::now();
        let policy = policy(true);
        let mut state = LoginAttemptState::default();
        for expected in 1..5 {
            state = policy.apply_failure(&state, now);
            assert_eq!(state.failed_count, expected);
            assert!(state.locked_until.is_none());
        }
        state = policy.apply_failure(&state, now);
        assert_eq!(state.failed_count, 0);
        assert_eq!(state.lockout_count, 1);
        assert_eq!(state.locked_until, Some(now + Duration::minutes(15)));
    }

    #[test]
    fn failures_during_lock_are_not_counted() {
        let now = Utc::now();
        let policy = policy(true);
        let locked = LoginAttemptState {
            failed_count: 0,
            locked_until: Some(now + Duration::minutes(5)),
            lockout_count: 1,
        };
        assert_eq!(policy.apply_failure(&locked, now), locked);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = policy(true);
        assert_eq!(policy.lock_duration(1), Duration::minutes(15));
        assert_eq!(policy.lock_duration(2), Duration::minutes(30));
        assert_eq!(policy.lock_duration(3), Duration::minutes(60));
        assert_eq!(policy.lock_duration(10), Duration::hours(24));
        assert_eq!(policy.lock_duration(i32::MAX), Duration::hours(24));
    }

    #[test]
    fn fixed_duration_without_backoff() {
        let policy = policy(false);
        assert_eq!(policy.lock_duration(1), Duration::minutes(15));
        assert_eq!(policy.lock_duration(4), Duration::minutes(15));
    }

    #[test]
    fn expired_lock_starts_a_new_count() {
        let now = Utc::now();
        let policy = policy(true);
        let expired = LoginAttemptState {
            failed_count: 0,
            locked_until: Some(now - Duration::seconds(1)),
            lockout_count: 1,
        };
        let next = policy.apply_failure(&expired, now);
        assert_eq!(next.failed_count, 1);
        assert_eq!(next.locked_until, None);
        assert_eq!(next.lockout_count, 1);
    }
}
