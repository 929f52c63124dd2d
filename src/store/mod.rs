//! Shared counter store abstraction.
//!
//! Every admission decision is derived from state held in an external
//! key-value store so that all server processes agree on the count. The
//! store is the only component that performs network I/O.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Failure talking to the shared store.
///
/// Never swallowed by a store implementation: the degradation policy one
/// layer up decides what a failure means for the request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection refused, reset, or otherwise unreachable
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The operation did not complete within the configured bound
    #[error("store operation `{op}` timed out after {timeout:?}")]
    Timeout {
        /// Store operation that timed out
        op: &'static str,
        /// Configured bound
        timeout: Duration,
    },

    /// The store answered with something we could not interpret
    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Protocol(err.to_string())
        }
    }
}

/// Operations the window policies need from a shared atomic key-value store.
///
/// All operations must be safe to call concurrently from many processes
/// against the same key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key` by one and return the new count.
    ///
    /// When the increment creates the key, its TTL is set to `window_ms` in
    /// the same atomic step.
    async fn incr_and_expire(&self, key: &str, window_ms: u64) -> Result<u64, StoreError>;

    /// Milliseconds until `key` expires; 0 when absent, expired, or without TTL.
    async fn remaining_ttl_ms(&self, key: &str) -> Result<u64, StoreError>;

    /// Set `key` only if it does not exist yet. Returns whether the set took
    /// effect. An existing key keeps its value and TTL.
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError>;

    /// Give `key` a TTL if it exists without one. Returns whether a TTL was set.
    async fn ensure_ttl(&self, key: &str, ttl_ms: u64) -> Result<bool, StoreError>;

    /// Read the raw value under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Delete every key matching a glob `pattern`. Returns the number deleted.
    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, StoreError>;
}

/// Decorator bounding every call on the wrapped store with a timeout.
///
/// A slow store surfaces as [`StoreError::Timeout`] instead of stalling the
/// request pipeline.
pub struct TimeoutStore<S: ?Sized> {
    inner: std::sync::Arc<S>,
    timeout: Duration,
}

impl<S: CounterStore + ?Sized> TimeoutStore<S> {
    /// Wrap `inner`, bounding each call by `timeout`.
    pub fn new(inner: std::sync::Arc<S>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// The configured per-call bound.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                op,
                timeout: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl<S: CounterStore + ?Sized> CounterStore for TimeoutStore<S> {
    async fn incr_and_expire(&self, key: &str, window_ms: u64) -> Result<u64, StoreError> {
        self.bounded("incr_and_expire", self.inner.incr_and_expire(key, window_ms))
            .await
    }

    async fn remaining_ttl_ms(&self, key: &str) -> Result<u64, StoreError> {
        self.bounded("remaining_ttl_ms", self.inner.remaining_ttl_ms(key))
            .await
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        self.bounded(
            "set_if_absent_with_ttl",
            self.inner.set_if_absent_with_ttl(key, value, ttl_ms),
        )
        .await
    }

    async fn ensure_ttl(&self, key: &str, ttl_ms: u64) -> Result<bool, StoreError> {
        self.bounded("ensure_ttl", self.inner.ensure_ttl(key, ttl_ms))
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.bounded("get", self.inner.get(key)).await
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        self.bounded("delete_by_pattern", self.inner.delete_by_pattern(pattern))
            .await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{DownStore, HangingStore};
    use super::*;
    use std::sync::Arc;
    use tokio_test::assert_err;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_store_bounds_hanging_call() {
        let store = TimeoutStore::new(Arc::new(HangingStore), Duration::from_millis(150));

        let started = tokio::time::Instant::now();
        let err = store.incr_and_expire("k", 1_000).await.unwrap_err();

        assert_eq!(
            err,
            StoreError::Timeout {
                op: "incr_and_expire",
                timeout: Duration::from_millis(150),
            }
        );
        assert!(started.elapsed() <= Duration::from_millis(151));
    }

    #[tokio::test]
    async fn test_timeout_store_passes_through_errors() {
        let store = TimeoutStore::new(Arc::new(DownStore), Duration::from_millis(150));
        let result = store.get("k").await;
        assert_err!(&result);
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_timeout_store_passes_through_values() {
        let store = TimeoutStore::new(Arc::new(MemoryStore::new()), Duration::from_millis(150));

        assert_eq!(store.incr_and_expire("k", 1_000).await, Ok(1));
        assert_eq!(store.incr_and_expire("k", 1_000).await, Ok(2));
        assert_eq!(store.get("k").await, Ok(Some("2".to_string())));
    }
}
