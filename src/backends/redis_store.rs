//! Redis Store - Distributed Shared Tier
//!
//! Redis-backed [`RemoteStore`] and [`Publisher`]. Replacements of ranked
//! sets and geo indexes run in one MULTI/EXEC pipeline so readers never see
//! a half-written index.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};

use crate::pattern::KeyPattern;
use crate::traits::{GeoMember, Publisher, RemoteStore};

/// Deletes KEYS[1] only when it still holds ARGV[1].
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis rounds expiries to whole seconds; never round a short TTL down to "no expiry".
fn ttl_secs(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis().div_ceil(1000))
        .unwrap_or(u64::MAX)
        .max(1)
}

/// Redis shared tier with `ConnectionManager` for automatic reconnection
pub struct RedisStore {
    /// Redis connection manager - handles reconnection automatically
    conn_manager: ConnectionManager,
    redis_url: String,
    unlock_script: Script,
}

impl RedisStore {
    /// Connect using `REDIS_URL`, falling back to a local Redis.
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or connection fails.
    pub async fn new() -> Result<Self> {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        Self::with_url(&redis_url).await
    }

    /// Connect to the given Redis URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or connection fails.
    pub async fn with_url(redis_url: &str) -> Result<Self> {
        info!(redis_url = %redis_url, "Initializing Redis store with ConnectionManager");

        let client = Client::open(redis_url)
            .with_context(|| format!("Failed to create Redis client with URL: {redis_url}"))?;

        let conn_manager = ConnectionManager::new(client)
            .await
            .context("Failed to establish Redis connection manager")?;

        let mut conn = conn_manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis PING health check failed")?;

        info!(redis_url = %redis_url, "Redis store connected successfully");

        Ok(Self {
            conn_manager,
            redis_url: redis_url.to_string(),
            unlock_script: Script::new(COMPARE_AND_DELETE),
        })
    }

    /// URL this store is connected to; subscribers open their own connection to it.
    #[must_use]
    pub fn redis_url(&self) -> &str {
        &self.redis_url
    }

    /// Scan keys matching a glob pattern with cursor-based SCAN (never KEYS).
    async fn scan_keys(&self, glob: &str) -> Result<Vec<String>> {
        let mut conn = self.conn_manager.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let result: (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(glob)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            cursor = result.0;
            keys.extend(result.1);

            if cursor == 0 {
                break;
            }
        }

        // SCAN may return a key more than once
        keys.sort_unstable();
        keys.dedup();

        debug!(pattern = %glob, count = keys.len(), "[Redis] Scanned keys matching pattern");
        Ok(keys)
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn_manager.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn.set_ex(key, value, ttl_secs(ttl)).await?;
        debug!(key = %key, ttl_secs = %ttl.as_secs(), "[Redis] Cached key with TTL");
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn_manager.clone();
        let count: usize = conn.del(keys).await?;
        debug!(count = count, "[Redis] Removed keys in bulk");
        Ok(count)
    }

    async fn keys_matching(&self, pattern: &KeyPattern) -> Result<Vec<String>> {
        if let KeyPattern::Exact(key) = pattern {
            let mut conn = self.conn_manager.clone();
            let exists: bool = conn.exists(key).await?;
            return Ok(if exists { vec![key.clone()] } else { Vec::new() });
        }
        self.scan_keys(&pattern.to_glob()).await
    }

    async fn create_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let deleted: i64 = self
            .unlock_script
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn_manager.clone();
        let value: i64 = conn.incr(key, 1).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let applied: bool = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(applied)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn_manager.clone();
        // -1 = no expiry, -2 = key doesn't exist
        let secs: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok((secs >= 0).then(|| Duration::from_secs(secs.unsigned_abs())))
    }

    async fn sorted_set_replace(&self, key: &str, members: &[(String, f64)], ttl: Duration) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !members.is_empty() {
            let scored: Vec<(f64, &str)> = members.iter().map(|(m, s)| (*s, m.as_str())).collect();
            pipe.zadd_multiple(key, &scored)
                .ignore()
                .cmd("EXPIRE")
                .arg(key)
                .arg(ttl_secs(ttl))
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        debug!(key = %key, count = members.len(), "[Redis] Replaced sorted set");
        Ok(())
    }

    async fn sorted_set_top_n(&self, key: &str, offset: usize, count: usize) -> Result<Vec<(String, f64)>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let start = isize::try_from(offset).context("offset out of range")?;
        let stop = isize::try_from(offset.saturating_add(count) - 1).context("count out of range")?;
        let mut conn = self.conn_manager.clone();
        let members: Vec<(String, f64)> = conn.zrevrange_withscores(key, start, stop).await?;
        Ok(members)
    }

    async fn geo_replace(&self, key: &str, members: &[GeoMember], ttl: Duration) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !members.is_empty() {
            pipe.cmd("GEOADD").arg(key);
            for member in members {
                pipe.arg(member.longitude).arg(member.latitude).arg(&member.member);
            }
            pipe.ignore().cmd("EXPIRE").arg(key).arg(ttl_secs(ttl)).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        debug!(key = %key, count = members.len(), "[Redis] Replaced geo index");
        Ok(())
    }

    async fn geo_radius(
        &self,
        key: &str,
        longitude: f64,
        latitude: f64,
        radius_km: f64,
    ) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn_manager.clone();
        let found: Vec<(String, f64)> = redis::cmd("GEOSEARCH")
            .arg(key)
            .arg("FROMLONLAT")
            .arg(longitude)
            .arg(latitude)
            .arg("BYRADIUS")
            .arg(radius_km)
            .arg("km")
            .arg("ASC")
            .arg("WITHDIST")
            .query_async(&mut conn)
            .await?;
        Ok(found)
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<usize> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn_manager.clone();
        let added: usize = conn.sadd(key, members).await?;
        Ok(added)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn_manager.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn_manager.clone();
        let value: Option<Vec<u8>> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        let mut conn = self.conn_manager.clone();
        let fields: HashMap<String, Vec<u8>> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn info(&self, section: &str) -> Result<String> {
        let mut conn = self.conn_manager.clone();
        let info: String = redis::cmd("INFO")
            .arg(section)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Redis INFO {section} failed"))?;
        Ok(info)
    }

    async fn ping(&self) -> bool {
        let mut conn = self.conn_manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}

#[async_trait]
impl Publisher for RedisStore {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let receivers: i64 = conn.publish(channel, payload).await?;
        debug!(channel = %channel, receivers = receivers, "[Redis] Published message");
        Ok(())
    }
}
