use std::{fmt, time::Duration};

use ::redis::{aio::ConnectionManager, AsyncCommands};
use async_trait::async_trait;
use tracing::info;

use crate::{
    error::{MonitorError, Result},
    lease::{LeaseService, LeaseToken},
};

/// Redis scripts for atomic lease operations
mod scripts {
    use ::redis::Script;

    /// Delete the key only while it still carries the caller's token.
    pub fn compare_and_delete() -> Script {
        Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            else
                return 0
            end
            "#,
        )
    }
}

/// Lease service shared by every replica through one Redis instance.
#[derive(Clone)]
pub struct RedisLeaseService {
    conn: ConnectionManager,
    prefix: String,
}

impl fmt::Debug for RedisLeaseService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLeaseService")
            .field("connection", &"ConnectionManager")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisLeaseService {
    pub async fn new(redis_url: &str) -> Result<Self> {
        info!(target: "lease", "Connecting to Redis lease backend at {}", redis_url);

        let client = ::redis::Client::open(redis_url)
            .map_err(|e| MonitorError::Lease(format!("Failed to create Redis client: {e}")))?;

        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| MonitorError::Lease(format!("Failed to connect to Redis: {e}")))?;

        Ok(Self {
            conn,
            prefix: "tally:lease:".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Current token stored for `name`, if any.
    pub async fn holder_token(&self, name: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(self.key(name))
            .await
            .map_err(|e| MonitorError::Lease(format!("Redis GET failed: {e}")))
    }
}

#[async_trait]
impl LeaseService for RedisLeaseService {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LeaseToken>> {
        let token = LeaseToken::new(name, ttl);
        let ttl_ms = ttl.as_millis().clamp(1, u128::from(u64::MAX)) as u64;
        let mut conn = self.conn.clone();

        let acquired: Option<String> = ::redis::cmd("SET")
            .arg(self.key(name))
            .arg(&token.token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| MonitorError::Lease(format!("Redis SET NX failed: {e}")))?;

        Ok(acquired.map(|_| token))
    }

    async fn release(&self, token: &LeaseToken) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = scripts::compare_and_delete()
            .key(self.key(&token.name))
            .arg(&token.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| MonitorError::Lease(format!("Redis lease release failed: {e}")))?;
        Ok(deleted > 0)
    }
}
