use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{LockoutPolicy, LoginAttemptGuard};
use crate::models::login_attempt::LoginAttemptState;

#[derive(Debug)]
pub struct InMemoryLoginAttemptGuard {
    policy: LockoutPolicy,
    attempts: Mutex<HashMap<String, LoginAttemptState>>,
}

impl InMemoryLoginAttemptGuard {
    pub fn new(policy: LockoutPolicy) -> Self {
        Self {
            policy,
            attempts: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl LoginAttemptGuard for InMemoryLoginAttemptGuard {
    async fn lock_status(&self, subject: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        let attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        Ok(attempts
            .get(subject)
            .and_then(|state| state.locked_at(Utc::now())))
    }

    async fn record_failure(&self, subject: &str) -> anyhow::Result<LoginAttemptState> {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let entry = attempts.entry(subject.to_string()).or_default();
        *entry = self.policy.apply_failure(entry, Utc::now());
        Ok(entry.clone())
    }

    async fn record_success(&self, subject: &str) -> anyhow::Result<()> {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.remove(subject);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn success_clears_counter() {
        let guard = InMemoryLoginAttemptGuard::new(LockoutPolicy {
            threshold: 3,
            base_duration: Duration::minutes(1),
            max_duration: Duration::hours(1),
            backoff: true,
        });
        guard.record_failure("a@example.com").await.unwrap();
        guard.record_failure("a@example.com").await.unwrap();
        guard.record_success("a@example.com").await.unwrap();

        let state = guard.record_failure("a@example.com").await.unwrap();
        assert_eq!(state.failed_count, 1);
        assert!(guard.lock_status("a@example.com").await.unwrap().is_none());
    }
}
