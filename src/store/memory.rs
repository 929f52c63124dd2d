//! In-process counter store.
//!
//! Used for single-process deployments (`store.backend: memory`) and tests.
//! Per-key atomicity comes from the shard lock `dashmap` holds while an
//! entry is borrowed. Expiry reads the tokio clock so paused-time tests can
//! step through windows.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::debug;

use super::{CounterStore, StoreError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A [`CounterStore`] held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }

    /// Purge expired entries every `every` on a background task.
    ///
    /// Without this the map keeps one entry per client and route ever seen.
    /// The task holds a weak reference and stops once the store is dropped.
    pub fn spawn_purge(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = store.len(), "Purged expired counters");
                }
            }
        })
    }

    /// Number of entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incr_and_expire(&self, key: &str, window_ms: u64) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut slot = self.entries.entry(key.to_owned()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: None,
        });

        if slot.is_expired(now) {
            slot.value = "0".to_string();
            slot.expires_at = None;
        }

        let current: u64 = slot.value.parse().map_err(|_| {
            StoreError::Protocol(format!("value at `{key}` is not an integer"))
        })?;
        let count = current + 1;
        slot.value = count.to_string();

        if count == 1 {
            slot.expires_at = Some(now + Duration::from_millis(window_ms));
        }

        Ok(count)
    }

    async fn remaining_ttl_ms(&self, key: &str) -> Result<u64, StoreError> {
        let now = Instant::now();
        let ttl = self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now).as_millis() as u64)
            .unwrap_or(0);
        Ok(ttl)
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let fresh = Entry {
            value: value.to_string(),
            expires_at: Some(now + Duration::from_millis(ttl_ms)),
        };

        match self.entries.entry(key.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn ensure_ttl(&self, key: &str, ttl_ms: u64) -> Result<bool, StoreError> {
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.expires_at.is_none() => {
                entry.expires_at = Some(Instant::now() + Duration::from_millis(ttl_ms));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone()))
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !glob_match(pattern, key));
        Ok((before - self.entries.len()) as u64)
    }
}

/// Match `text` against a Redis-style glob supporting `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            p += 1;
            resume = t;
        } else if let Some(s) = star {
            p = s + 1;
            resume += 1;
            t = resume;
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_incr_sets_ttl_on_creation() {
        let store = MemoryStore::new();

        assert_eq!(store.incr_and_expire("k", 1_000).await.unwrap(), 1);
        assert_eq!(store.remaining_ttl_ms("k").await.unwrap(), 1_000);

        tokio::time::advance(Duration::from_millis(400)).await;

        // Later increments must not push the expiry out.
        assert_eq!(store.incr_and_expire("k", 1_000).await.unwrap(), 2);
        assert_eq!(store.remaining_ttl_ms("k").await.unwrap(), 600);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_restarts_after_expiry() {
        let store = MemoryStore::new();

        store.incr_and_expire("k", 100).await.unwrap();
        store.incr_and_expire("k", 100).await.unwrap();
        tokio::time::advance(Duration::from_millis(101)).await;

        assert_eq!(store.remaining_ttl_ms("k").await.unwrap(), 0);
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.incr_and_expire("k", 100).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.incr_and_expire("k", 60_000).await.unwrap() })
            })
            .collect();

        let mut counts: Vec<u64> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        counts.sort_unstable();

        assert_eq!(counts, (1..=64).collect::<Vec<u64>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_keeps_existing_ttl() {
        let store = MemoryStore::new();

        assert!(store.set_if_absent_with_ttl("b", "1", 1_800).await.unwrap());
        tokio::time::advance(Duration::from_millis(800)).await;
        assert!(!store.set_if_absent_with_ttl("b", "1", 1_800).await.unwrap());
        assert_eq!(store.remaining_ttl_ms("b").await.unwrap(), 1_000);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(store.set_if_absent_with_ttl("b", "1", 1_800).await.unwrap());
    }

    #[tokio::test]
    async fn test_incr_rejects_non_integer_value() {
        let store = MemoryStore::new();
        store.set_if_absent_with_ttl("k", "blocked", 1_000).await.unwrap();

        let err = store.incr_and_expire("k", 1_000).await.unwrap_err();
        assert!(matches!(err, StoreError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_ensure_ttl_only_touches_persistent_keys() {
        let store = MemoryStore::new();
        store.entries.insert(
            "stuck".to_string(),
            Entry {
                value: "7".to_string(),
                expires_at: None,
            },
        );

        assert_eq!(store.remaining_ttl_ms("stuck").await.unwrap(), 0);
        assert!(store.ensure_ttl("stuck", 500).await.unwrap());
        assert!(!store.ensure_ttl("stuck", 500).await.unwrap());
        assert!(!store.ensure_ttl("missing", 500).await.unwrap());
        assert!(store.remaining_ttl_ms("stuck").await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_delete_by_pattern() {
        let store = MemoryStore::new();
        store.incr_and_expire("rl:auth:1.2.3.4:POST:/login", 1_000).await.unwrap();
        store.incr_and_expire("rl:auth:5.6.7.8:POST:/login", 1_000).await.unwrap();
        store.incr_and_expire("rl:api:1.2.3.4:GET:/users", 1_000).await.unwrap();

        assert_eq!(store.delete_by_pattern("rl:auth:*").await.unwrap(), 2);
        assert_eq!(store.len(), 1);
        assert!(store.get("rl:api:1.2.3.4:GET:/users").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store.incr_and_expire("short", 10).await.unwrap();
        store.incr_and_expire("long", 10_000).await.unwrap();

        tokio::time::advance(Duration::from_millis(20)).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_purge() {
        let store = Arc::new(MemoryStore::new());
        let purge = store.spawn_purge(Duration::from_secs(1));

        store.incr_and_expire("short", 500).await.unwrap();
        store.incr_and_expire("long", 5_000).await.unwrap();
        assert_eq!(store.len(), 2);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("long").await.unwrap().as_deref(), Some("1"));

        // The task ends with the store.
        drop(store);
        purge.await.unwrap();
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("rl:auth:*", "rl:auth:1.2.3.4:POST:/login"));
        assert!(glob_match("*", ""));
        assert!(glob_match("rl:?:x", "rl:a:x"));
        assert!(glob_match("rl:*:block", "rl:auth:1.2.3.4:POST:/login:block"));
        assert!(!glob_match("rl:auth:*", "rl:api:1.2.3.4"));
        assert!(!glob_match("rl:?:x", "rl:ab:x"));
    }
}
