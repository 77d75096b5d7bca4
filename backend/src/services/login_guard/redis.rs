//! Counters live in `login_attempts:{subject}` hashes that expire after the
//! maximum lock duration. A failure is evaluated by one Lua script via `EVAL`.

use async_trait::async_trait;
use bb8_redis::redis::{self, AsyncCommands};
use chrono::{DateTime, Utc};

use super::{LockoutPolicy, LoginAttemptGuard};
use crate::db::redis::RedisPool;
use crate::models::login_attempt::LoginAttemptState;

const RECORD_FAILURE_SCRIPT: &str = r#"
local now = tonumber(ARGV[5])
local s = redis.call('HMGET', KEYS[1], 'failed_count', 'locked_until', 'lockout_count')
local failed = tonumber(s[1]) or 0
local locked_until = tonumber(s[2]) or 0
local lockouts = tonumber(s[3]) or 0
if locked_until > now then
  return {failed, locked_until, lockouts}
end
failed = failed + 1
locked_until = 0
if failed >= tonumber(ARGV[1]) then
  failed = 0
  lockouts = lockouts + 1
  local duration = tonumber(ARGV[2])
  if ARGV[4] == '1' then
    local exponent = lockouts - 1
    if exponent > 30 then exponent = 30 end
    duration = duration * math.pow(2, exponent)
  end
  local max = tonumber(ARGV[3])
  if duration > max then duration = max end
  locked_until = math.floor(now + duration)
end
redis.call('HSET', KEYS[1], 'failed_count', failed, 'locked_until', locked_until, 'lockout_count', lockouts)
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return {failed, locked_until, lockouts}
"#;

pub struct RedisLoginAttemptGuard {
    pool: RedisPool,
    policy: LockoutPolicy,
}

impl RedisLoginAttemptGuard {
    pub fn new(pool: RedisPool, policy: LockoutPolicy) -> Self {
        Self { pool, policy }
    }

    fn attempts_key(subject: &str) -> String {
        format!("login_attempts:{}", subject)
    }
}

#[async_trait]
impl LoginAttemptGuard for RedisLoginAttemptGuard {
    async fn lock_status(&self, subject: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        let mut conn = self.pool.get().await?;
        let locked_until: Option<i64> = conn
            .hget(Self::attempts_key(subject), "locked_until")
            .await?;
        Ok(locked_until
            .filter(|millis| *millis > 0)
            .and_then(DateTime::from_timestamp_millis)
            .filter(|until| *until > Utc::now()))
    }

    async fn record_failure(&self, subject: &str) -> anyhow::Result<LoginAttemptState> {
        let mut conn = self.pool.get().await?;
        let (failed_count, locked_until, lockout_count): (i64, i64, i64) = redis::cmd("EVAL")
            .arg(RECORD_FAILURE_SCRIPT)
            .arg(1)
            .arg(Self::attempts_key(subject))
            .arg(self.policy.threshold)
            .arg(self.policy.base_duration.num_milliseconds())
            .arg(self.policy.max_duration.num_milliseconds())
            .arg(if self.policy.backoff { "1" } else { "0" })
            .arg(Utc::now().timestamp_millis())
            .query_async(&mut *conn)
            .await?;

        Ok(LoginAttemptState {
            failed_count: failed_count as i32,
            locked_until: Some(locked_until)
                .filter(|millis| *millis > 0)
                .and_then(DateTime::from_timestamp_millis),
            lockout_count: lockout_count as i32,
        })
    }

    async fn record_success(&self, subject: &str) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;
        conn.del::<_, ()>(Self::attempts_key(subject)).await?;
        Ok(())
    }
}
