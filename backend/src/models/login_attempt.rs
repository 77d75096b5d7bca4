//! Consecutive-failure counters backing account lockout.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, FromRow)]
pub struct LoginAttemptState {
    pub failed_count: i32,
    pub locked_until: Option<DateTime<Utc>>,
    /// How many times the account has been locked since the last success; drives backoff.
    pub lockout_count: i32,
}

impl LoginAttemptState {
    pub fn locked_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.locked_until.filter(|until| *until > now)
    }
}
