//! Redis-backed family store.
//!
//! Layout:
//! - `refresh_family:{family_id}`: hash with the family fields; `PEXPIREAT` at
//!   the absolute ceiling so expired families vanish on their own.
//! - `refresh_families:{subject}`: set of family ids owned by the subject.
//!
//! Rotation and revocation run as Lua scripts via `EVAL` so each is one
//! atomic step on the server. The subject set expires with the subject's
//! latest family ceiling; the sweeper prunes members whose family is gone. Timestamps are stored as unix milliseconds.

use std::collections::HashMap;

use async_trait::async_trait;
use bb8_redis::redis::{self, AsyncCommands};
use chrono::{DateTime, Utc};
use tracing::Instrument;

use super::{Anomalies, NewFamily, RefreshTokenStore, RotationOutcome, RotationRequest};
use crate::db::redis::RedisPool;
use crate::models::session::{RefreshTokenFamily, RevokeReason};
use crate::types::FamilyId;

const ROTATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {'unknown', '0', '0', {}}
end
local f = redis.call('HMGET', KEYS[1], 'current_hash', 'previous_hash', 'fingerprint', 'last_seen_ip', 'expires_at', 'revoked')
local now = tonumber(ARGV[7])
if f[6] == '1' or tonumber(f[5]) <= now then
  return {'unknown', '0', '0', {}}
end
if f[1] == ARGV[1] then
  local dev = '0'
  local ip = '0'
  if f[3] ~= ARGV[3] then dev = '1' end
  if f[4] ~= ARGV[4] then ip = '1' end
  if (dev == '1' and ARGV[5] == '1') or (ip == '1' and ARGV[6] == '1') then
    return {'held', dev, ip, redis.call('HGETALL', KEYS[1])}
  end
  redis.call('HSET', KEYS[1], 'previous_hash', f[1], 'current_hash', ARGV[2], 'last_seen_ip', ARGV[4], 'last_rotated_at', ARGV[7])
  redis.call('HINCRBY', KEYS[1], 'version', 1)
  return {'rotated', dev, ip, redis.call('HGETALL', KEYS[1])}
end
local outcome = 'tampered'
local reason = 'tampered'
if f[2] and f[2] ~= '' and f[2] == ARGV[1] then
  outcome = 'replay'
  reason = 'replay_detected'
end
redis.call('HSET', KEYS[1], 'revoked', '1', 'revoked_reason', reason, 'revoked_at', ARGV[7])
redis.call('HINCRBY', KEYS[1], 'version', 1)
return {outcome, '0', '0', redis.call('HGETALL', KEYS[1])}
"#;

const REVOKE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
local f = redis.call('HMGET', KEYS[1], 'revoked', 'expires_at')
if f[1] == '1' or tonumber(f[2]) <= tonumber(ARGV[2]) then
  return 0
end
redis.call('HSET', KEYS[1], 'revoked', '1', 'revoked_reason', ARGV[1], 'revoked_at', ARGV[2])
redis.call('HINCRBY', KEYS[1], 'version', 1)
return 1
"#;

type ScriptReply = (String, String, String, HashMap<String, String>);

pub struct RedisRefreshTokenStore {
    pool: RedisPool,
}

impl RedisRefreshTokenStore {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    fn family_key(family_id: FamilyId) -> String {
        format!("refresh_family:{}", family_id)
    }

    fn subject_key(subject: &str) -> String {
        format!("refresh_families:{}", subject)
    }

    async fn revoke_with_script<C>(
        &self,
        conn: &mut C,
        family_id: FamilyId,
        reason: RevokeReason,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>
    where
        C: redis::aio::ConnectionLike + Send,
    {
        let changed: i64 = eval(REVOKE_SCRIPT, Self::family_key(family_id))
            .arg(reason.as_str())
            .arg(now.timestamp_millis())
            .query_async(conn)
            .await?;
        Ok(changed == 1)
    }

    /// Drops subject-index entries whose family hash has expired; returns how many.
    async fn prune_subject_index<C>(conn: &mut C, subject_key: &str) -> anyhow::Result<u64>
    where
        C: redis::aio::ConnectionLike + Send,
    {
        let members: Vec<String> = conn.smembers(subject_key).await?;
        let mut pruned = 0;
        for member in members {
            let Ok(family_id) = member.parse::<FamilyId>() else {
                conn.srem::<_, _, ()>(subject_key, &member).await?;
                pruned += 1;
                continue;
            };
            let exists: bool = conn.exists(Self::family_key(family_id)).await?;
            if !exists {
                conn.srem::<_, _, ()>(subject_key, &member).await?;
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}

#[async_trait]
impl RefreshTokenStore for RedisRefreshTokenStore {
    async fn create(&self, family: NewFamily) -> anyhow::Result<RefreshTokenFamily> {
        let mut family = family.into_family(truncate_millis(Utc::now()));
        family.absolute_expires_at = truncate_millis(family.absolute_expires_at);

        let span = tracing::debug_span!("redis_create_family", family_id = %family.family_id);
        async {
            let mut conn = self.pool.get().await?;
            let key = Self::family_key(family.family_id);
            let subject_key = Self::subject_key(&family.subject);
            let expires_at = family.absolute_expires_at.timestamp_millis();
            let fields = family_to_fields(&family);

            redis::pipe()
                .atomic()
                .hset_multiple(&key, &fields[..])
                .ignore()
                .cmd("PEXPIREAT")
                .arg(&key)
                .arg(expires_at)
                .ignore()
                .sadd(&subject_key, family.family_id.to_string())
                .ignore()
                // The index lives as long as the subject's latest ceiling:
                // NX covers a fresh set, GT only ever extends.
                .cmd("PEXPIREAT")
                .arg(&subject_key)
                .arg(expires_at)
                .arg("NX")
                .ignore()
                .cmd("PEXPIREAT")
                .arg(&subject_key)
                .arg(expires_at)
                .arg("GT")
                .ignore()
                .query_async::<_, ()>(&mut *conn)
                .await?;
            Ok::<_, anyhow::Error>(family)
        }
        .instrument(span)
        .await
    }

    async fn try_rotate(&self, request: RotationRequest) -> anyhow::Result<RotationOutcome> {
        let span = tracing::debug_span!("redis_try_rotate", family_id = %request.family_id);
        async {
            let mut conn = self.pool.get().await?;
            let (outcome, device_flag, ip_flag, fields): ScriptReply =
                eval(ROTATE_SCRIPT, Self::family_key(request.family_id))
                    .arg(&request.presented_hash)
                    .arg(&request.next_hash)
                    .arg(&request.device_fingerprint)
                    .arg(&request.ip)
                    .arg(flag(request.hold_on_device_mismatch))
                    .arg(flag(request.hold_on_ip_mismatch))
                    .arg(Utc::now().timestamp_millis())
                    .query_async(&mut *conn)
                    .await?;

            let anomalies = Anomalies {
                device_mismatch: device_flag == "1",
                ip_mismatch: ip_flag == "1",
            };
            let outcome = match outcome.as_str() {
                "unknown" => RotationOutcome::Unknown,
                "held" => RotationOutcome::Held {
                    family: family_from_fields(request.family_id, &fields)?,
                    anomalies,
                },
                "rotated" => RotationOutcome::Rotated {
                    family: family_from_fields(request.family_id, &fields)?,
                    anomalies,
                },
                "replay" => RotationOutcome::ReplayDetected {
                    family: family_from_fields(request.family_id, &fields)?,
                },
                "tampered" => RotationOutcome::Tampered {
                    family: family_from_fields(request.family_id, &fields)?,
                },
                other => anyhow::bail!("unexpected rotation outcome from Redis: {}", other),
            };
            Ok::<_, anyhow::Error>(outcome)
        }
        .instrument(span)
        .await
    }

    async fn revoke_family(
        &self,
        family_id: FamilyId,
        reason: RevokeReason,
    ) -> anyhow::Result<bool> {
        let mut conn = self.pool.get().await?;
        self.revoke_with_script(&mut *conn, family_id, reason, Utc::now())
            .await
    }

    async fn revoke_all_for_subject(
        &self,
        subject: &str,
        reason: RevokeReason,
    ) -> anyhow::Result<u64> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now();
        let members: Vec<String> = conn.smembers(Self::subject_key(subject)).await?;

        let mut revoked = 0;
        for family_id in members.iter().filter_map(|m| m.parse::<FamilyId>().ok()) {
            if self
                .revoke_with_script(&mut *conn, family_id, reason, now)
                .await?
            {
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn find_family(&self, family_id: FamilyId) -> anyhow::Result<Option<RefreshTokenFamily>> {
        let mut conn = self.pool.get().await?;
        let fields: HashMap<String, String> = conn.hgetall(Self::family_key(family_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(family_from_fields(family_id, &fields)?))
    }

    async fn list_families_for_subject(
        &self,
        subject: &str,
    ) -> anyhow::Result<Vec<RefreshTokenFamily>> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now();
        let members: Vec<String> = conn.smembers(Self::subject_key(subject)).await?;

        let mut families = Vec::with_capacity(members.len());
        for family_id in members.iter().filter_map(|m| m.parse::<FamilyId>().ok()) {
            let fields: HashMap<String, String> =
                conn.hgetall(Self::family_key(family_id)).await?;
            if fields.is_empty() {
                continue;
            }
            let family = family_from_fields(family_id, &fields)?;
            if family.absolute_expires_at > now {
                families.push(family);
            }
        }
        families.sort_by(|a, b| b.last_rotated_at.cmp(&a.last_rotated_at));
        Ok(families)
    }

    /// Family hashes expire on their own; this prunes dangling subject-index entries.
    async fn sweep_expired(&self, _now: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut conn = self.pool.get().await?;
        let mut cursor: u64 = 0;
        let mut pruned = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg("refresh_families:*")
                .arg("COUNT")
                .arg(200)
                .query_async(&mut *conn)
                .await?;
            for key in keys {
                pruned += Self::prune_subject_index(&mut *conn, &key).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(pruned)
    }
}

/// `EVAL script 1 key`; callers append the script's ARGV.
fn eval(script: &str, key: String) -> redis::Cmd {
    let mut cmd = redis::cmd("EVAL");
    cmd.arg(script).arg(1).arg(key);
    cmd
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

fn family_to_fields(family: &RefreshTokenFamily) -> Vec<(&'static str, String)> {
    vec![
        ("subject", family.subject.clone()),
        ("current_hash", family.current_token_hash.clone()),
        (
            "previous_hash",
            family.previous_token_hash.clone().unwrap_or_default(),
        ),
        ("fingerprint", family.device_fingerprint.clone()),
        ("issuing_ip", family.issuing_ip.clone()),
        ("last_seen_ip", family.last_seen_ip.clone()),
        ("provider", family.provider.clone()),
        ("issued_at", family.issued_at.timestamp_millis().to_string()),
        (
            "last_rotated_at",
            family.last_rotated_at.timestamp_millis().to_string(),
        ),
        (
            "expires_at",
            family.absolute_expires_at.timestamp_millis().to_string(),
        ),
        ("revoked", flag(family.revoked).to_string()),
        (
            "revoked_reason",
            family
                .revoked_reason
                .map(|reason| reason.as_str().to_string())
                .unwrap_or_default(),
        ),
        (
            "revoked_at",
            family
                .revoked_at
                .map(|at| at.timestamp_millis().to_string())
                .unwrap_or_default(),
        ),
        ("version", family.version.to_string()),
    ]
}

fn family_from_fields(
    family_id: FamilyId,
    fields: &HashMap<String, String>,
) -> anyhow::Result<RefreshTokenFamily> {
    let text = |name: &str| -> anyhow::Result<String> {
        fields
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("refresh family {} missing field {}", family_id, name))
    };
    let optional = |name: &str| fields.get(name).filter(|value| !value.is_empty()).cloned();
    let millis = |raw: &str| -> anyhow::Result<DateTime<Utc>> {
        let value: i64 = raw.parse()?;
        DateTime::from_timestamp_millis(value)
            .ok_or_else(|| anyhow::anyhow!("timestamp out of range: {}", value))
    };

    Ok(RefreshTokenFamily {
        family_id,
        subject: text("subject")?,
        current_token_hash: text("current_hash")?,
        previous_token_hash: optional("previous_hash"),
        device_fingerprint: text("fingerprint")?,
        issuing_ip: text("issuing_ip")?,
        last_seen_ip: text("last_seen_ip")?,
        provider: text("provider")?,
        issued_at: millis(&text("issued_at")?)?,
        last_rotated_at: millis(&text("last_rotated_at")?)?,
        absolute_expires_at: millis(&text("expires_at")?)?,
        revoked: text("revoked")? == "1",
        revoked_reason: optional("revoked_reason")
            .map(|reason| reason.parse::<RevokeReason>())
            .transpose()?,
        revoked_at: optional("revoked_at")
            .map(|raw| millis(&raw))
            .transpose()?,
        version: text("version")?.parse()?,
    })
}
