//! Redis-backed admission state shared by every Guardian instance.
//!
//! Each counter is a hash updated by a single Lua script, so the
//! read-modify-write of one `(identity, route class)` key is atomic across
//! instances. Counter keys carry a TTL of two windows plus the block
//! duration, which makes Redis expire stale entries on its own.
//!
//! Gated behind the `redis_backend` Cargo feature.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use guardian_core::{
    AdmissionStats, AdmissionStore, ClientIdentity, CounterHit, GuardianError, HitOutcome,
    Result, RouteClass, RouteLimit, RouteLimits,
};
use redis::AsyncCommands;

const HIT_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
local block = tonumber(ARGV[4])
local state = redis.call('HMGET', key, 'ws', 'count', 'bu')
local ws = tonumber(state[1]) or now
local count = tonumber(state[2]) or 0
local bu = tonumber(state[3]) or 0
if bu > 0 then
  if now < bu then
    redis.call('PEXPIRE', key, window * 2 + (bu - now))
    local remaining = max - count
    if remaining < 0 then remaining = 0 end
    return {2, remaining, bu}
  end
  ws = now
  count = 0
  bu = 0
end
if now - ws >= window then
  ws = now
  count = 0
end
count = count + 1
local outcome = 0
if count > max then
  bu = now + block
  outcome = 1
end
redis.call('HSET', key, 'ws', ws, 'count', count, 'bu', bu)
redis.call('PEXPIRE', key, window * 2 + block)
local remaining = max - count
if remaining < 0 then remaining = 0 end
return {outcome, remaining, bu}
"#;

const KEY_PREFIX: &str = "guardian:admission";

/// Admission store shared through Redis.
pub struct RedisAdmissionStore {
    conn: redis::aio::ConnectionManager,
    hit_script: redis::Script,
}

impl RedisAdmissionStore {
    /// Connect to a Redis instance, e.g. `redis://127.0.0.1:6379`.
    pub async fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| GuardianError::Storage(format!("Invalid Redis URL: {e}")))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| GuardianError::Storage(format!("Failed to connect to Redis: {e}")))?;
        Ok(Self {
            conn,
            hit_script: redis::Script::new(HIT_SCRIPT),
        })
    }

    fn counter_key(identity: &ClientIdentity, class: RouteClass) -> String {
        format!("{KEY_PREFIX}:counter:{class}:{identity}")
    }

    fn violation_key(identity: &ClientIdentity, now: DateTime<Utc>) -> String {
        format!(
            "{KEY_PREFIX}:violations:{}:{identity}",
            now.format("%Y%m%d")
        )
    }

    fn blacklist_key() -> String {
        format!("{KEY_PREFIX}:blacklist")
    }

    /// Collect keys matching `pattern` with cursor-based `SCAN`.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .map_err(|e| GuardianError::Storage(format!("Redis SCAN failed: {e}")))?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    if ms <= 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

#[async_trait]
impl AdmissionStore for RedisAdmissionStore {
    async fn hit(
        &self,
        identity: &ClientIdentity,
        route_class: RouteClass,
        limit: &RouteLimit,
        now: DateTime<Utc>,
    ) -> Result<CounterHit> {
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .hit_script
            .key(Self::counter_key(identity, route_class))
            .arg(now.timestamp_millis())
            .arg(limit.window_ms)
            .arg(limit.max_requests)
            .arg(limit.block_duration_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| GuardianError::Storage(format!("Redis admission script failed: {e}")))?;

        let &[code, remaining, blocked_until] = reply.as_slice() else {
            return Err(GuardianError::Storage(
                "Redis admission script returned an unexpected reply".to_string(),
            ));
        };
        let outcome = match code {
            0 => HitOutcome::Allowed,
            1 => HitOutcome::NewlyBlocked,
            _ => HitOutcome::StillBlocked,
        };
        Ok(CounterHit {
            outcome,
            remaining: u32::try_from(remaining).unwrap_or(0),
            blocked_until: millis_to_datetime(blocked_until),
        })
    }

    async fn record_violation(
        &self,
        identity: &ClientIdentity,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let mut conn = self.conn.clone();
        let key = Self::violation_key(identity, now);
        let (count,): (u32,) = redis::pipe()
            .atomic()
            .incr(&key, 1)
            .expire(&key, 2 * 24 * 3600)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| GuardianError::Storage(format!("Redis INCR failed: {e}")))?;
        Ok(count)
    }

    async fn is_blacklisted(&self, identity: &ClientIdentity) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.sismember(Self::blacklist_key(), identity.as_str())
            .await
            .map_err(|e| GuardianError::Storage(format!("Redis SISMEMBER failed: {e}")))
    }

    async fn blacklist(&self, identity: &ClientIdentity) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(Self::blacklist_key(), identity.as_str())
            .await
            .map_err(|e| GuardianError::Storage(format!("Redis SADD failed: {e}")))
    }

    async fn unblacklist(&self, identity: &ClientIdentity) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u32 = conn
            .srem(Self::blacklist_key(), identity.as_str())
            .await
            .map_err(|e| GuardianError::Storage(format!("Redis SREM failed: {e}")))?;
        Ok(removed > 0)
    }

    async fn blacklisted(&self) -> Result<Vec<ClientIdentity>> {
        let mut conn = self.conn.clone();
        let mut members: Vec<String> = conn
            .smembers(Self::blacklist_key())
            .await
            .map_err(|e| GuardianError::Storage(format!("Redis SMEMBERS failed: {e}")))?;
        members.sort();
        Ok(members.into_iter().map(ClientIdentity).collect())
    }

    async fn reset_identity(&self, identity: &ClientIdentity) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut keys: Vec<String> = RouteClass::ALL
            .iter()
            .map(|class| Self::counter_key(identity, *class))
            .collect();
        keys.push(Self::violation_key(identity, Utc::now()));
        let removed: usize = conn
            .del(keys)
            .await
            .map_err(|e| GuardianError::Storage(format!("Redis DEL failed: {e}")))?;
        Ok(removed)
    }

    async fn sweep(&self, _limits: &RouteLimits, _now: DateTime<Utc>) -> Result<usize> {
        // Counter keys expire through their TTL.
        Ok(0)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<AdmissionStats> {
        let mut stats = AdmissionStats::default();
        let mut conn = self.conn.clone();
        for class in RouteClass::ALL {
            let keys = self
                .scan_keys(&format!("{KEY_PREFIX}:counter:{class}:*"))
                .await?;
            stats.by_route_class.insert(class, keys.len());
            stats.total_tracked += keys.len();
            for key in keys {
                let blocked_until: Option<i64> = conn
                    .hget(&key, "bu")
                    .await
                    .map_err(|e| GuardianError::Storage(format!("Redis HGET failed: {e}")))?;
                if blocked_until
                    .and_then(millis_to_datetime)
                    .is_some_and(|until| until > now)
                {
                    stats.blocked += 1;
                }
            }
        }
        stats.blacklisted = conn
            .scard(Self::blacklist_key())
            .await
            .map_err(|e| GuardianError::Storage(format!("Redis SCARD failed: {e}")))?;
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Tests (require a running Redis instance)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> RedisAdmissionStore {
        RedisAdmissionStore::new("redis://127.0.0.1:6379")
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore = "requires a running Redis instance"]
    async fn test_redis_hit_blocks_past_capacity() {
        let store = store().await;
        let identity = ClientIdentity::new(format!("test-{}", uuid::Uuid::new_v4()));
        let limit = RouteLimit::new(60_000, 2, 60_000);
        let now = Utc::now();
        assert_eq!(
            store.hit(&identity, RouteClass::Api, &limit, now).await.unwrap().outcome,
            HitOutcome::Allowed
        );
        store.hit(&identity, RouteClass::Api, &limit, now).await.unwrap();
        let third = store.hit(&identity, RouteClass::Api, &limit, now).await.unwrap();
        assert_eq!(third.outcome, HitOutcome::NewlyBlocked);
        assert!(third.blocked_until.is_some());
        let fourth = store.hit(&identity, RouteClass::Api, &limit, now).await.unwrap();
        assert_eq!(fourth.outcome, HitOutcome::StillBlocked);
        store.reset_identity(&identity).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running Redis instance"]
    async fn test_redis_blacklist() {
        let store = store().await;
        let identity = ClientIdentity::new(format!("test-{}", uuid::Uuid::new_v4()));
        store.blacklist(&identity).await.unwrap();
        assert!(store.is_blacklisted(&identity).await.unwrap());
        assert!(store.unblacklist(&identity).await.unwrap());
    }
}
