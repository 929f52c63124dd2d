//! Redis-backed counter store.
//!
//! Increment-with-expiry runs as a Lua script so the TTL is set in the same
//! atomic step that creates the key. A crash between `INCR` and `PEXPIRE`
//! therefore cannot leave a counter that never expires.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ::redis::aio::ConnectionManager;
use ::redis::{Client, Script};
use async_trait::async_trait;
use tracing::{debug, info};

use super::{CounterStore, StoreError};

const INCR_AND_EXPIRE: &str = r#"
local count = redis.call("INCR", KEYS[1])
if count == 1 then
    redis.call("PEXPIRE", KEYS[1], ARGV[1])
end
return count
"#;

const ENSURE_TTL: &str = r#"
if redis.call("PTTL", KEYS[1]) == -1 then
    return redis.call("PEXPIRE", KEYS[1], ARGV[1])
end
return 0
"#;

/// Keys fetched per `SCAN` round trip during pattern deletes.
const SCAN_BATCH: u64 = 500;

/// A [`CounterStore`] backed by one or more Redis connection managers.
///
/// Connections are handed out round-robin; each `ConnectionManager`
/// multiplexes and reconnects on its own.
pub struct RedisStore {
    connections: Arc<Vec<ConnectionManager>>,
    next: AtomicUsize,
    incr_script: Script,
    ensure_ttl_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl RedisStore {
    /// Open `connection_count` managed connections to the Redis at `url`.
    ///
    /// Host, port, credentials and logical database all come from the URL,
    /// e.g. `redis://:secret@10.0.0.5:6379/2`.
    pub async fn connect(url: &str, connection_count: usize) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let mut connections = Vec::with_capacity(connection_count);
        for _ in 0..connection_count {
            connections.push(client.get_connection_manager().await?);
        }

        let store = Self::from_connections(connections)?;
        info!(connections = connection_count, "Connected to Redis counter store");
        Ok(store)
    }

    /// Build a store over already established connection managers.
    pub fn from_connections(connections: Vec<ConnectionManager>) -> Result<Self, StoreError> {
        if connections.is_empty() {
            return Err(StoreError::Protocol(
                "connection count must be > 0".to_string(),
            ));
        }

        Ok(Self {
            connections: Arc::new(connections),
            next: AtomicUsize::new(0),
            incr_script: Script::new(INCR_AND_EXPIRE),
            ensure_ttl_script: Script::new(ENSURE_TTL),
        })
    }

    fn connection(&self) -> ConnectionManager {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        self.connections[index % self.connections.len()].clone()
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn incr_and_expire(&self, key: &str, window_ms: u64) -> Result<u64, StoreError> {
        let mut conn = self.connection();
        let count: u64 = self
            .incr_script
            .key(key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn remaining_ttl_ms(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection();
        // -2 when the key is absent, -1 when it exists without an expiry.
        let ttl: i64 = ::redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(ttl.max(0) as u64)
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn ensure_ttl(&self, key: &str, ttl_ms: u64) -> Result<bool, StoreError> {
        let mut conn = self.connection();
        let applied: i64 = self
            .ensure_ttl_script
            .key(key)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection();
        let value: Option<String> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection();
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let removed: u64 = ::redis::cmd("UNLINK")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await?;
                deleted += removed;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %pattern, deleted, "Deleted keys by pattern");
        Ok(deleted)
    }
}
