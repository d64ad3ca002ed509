//! Process-wide read-through cache
//!
//! Used by public listing read paths. One component owns the cache; call
//! sites go through `get_or_compute` rather than sharing ambient mutable
//! state. Entries live for a fixed TTL; when a recompute fails and a stale
//! entry exists, the stale value is served and the failure is logged
//! (stale-fallback-on-error).

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::error::EngineResult;

struct CacheEntry<T> {
    value: T,
    stored_at: Instant,
}

/// In-memory TTL cache with stale-fallback-on-error semantics.
pub struct ReadCache<T> {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry<T>>>,
}

impl<T: Clone> ReadCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Return the cached value for `key` if fresh, otherwise run `compute`.
    ///
    /// A successful compute replaces the entry. A failed compute falls back
    /// to the stale entry when one exists; only when there is nothing to
    /// serve does the error propagate.
    pub async fn get_or_compute<F, Fut>(&self, key: &str, compute: F) -> EngineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(key) {
                if entry.stored_at.elapsed() < self.ttl {
                    return Ok(entry.value.clone());
                }
            }
        }

        match compute().await {
            Ok(value) => {
                let mut entries = self.entries.write().await;
                entries.insert(
                    key.to_string(),
                    CacheEntry {
                        value: value.clone(),
                        stored_at: Instant::now(),
                    },
                );
                Ok(value)
            }
            Err(e) => {
                let entries = self.entries.read().await;
                if let Some(entry) = entries.get(key) {
                    tracing::warn!(
                        key = %key,
                        error = %e,
                        "Cache recompute failed, serving stale entry"
                    );
                    return Ok(entry.value.clone());
                }
                Err(e)
            }
        }
    }

    /// Drop an entry so the next read recomputes.
    pub async fn invalidate(&self, key: &str) {
        self.entries.write().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_fresh_entry_skips_recompute() {
        let cache: ReadCache<String> = ReadCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_compute("listing", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("establishments".to_string())
                })
                .await
                .unwrap();
            assert_eq!(value, "establishments");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_recomputes() {
        let cache: ReadCache<u32> = ReadCache::new(Duration::ZERO);
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            cache
                .get_or_compute("k", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_fallback_on_error() {
        let cache: ReadCache<u32> = ReadCache::new(Duration::ZERO);

        cache.get_or_compute("k", || async { Ok(42) }).await.unwrap();

        // Entry is already stale (TTL zero); the failing recompute should
        // fall back to it rather than surface the error.
        let value = cache
            .get_or_compute("k", || async {
                Err(EngineError::Database("connection refused".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_error_with_no_stale_entry_propagates() {
        let cache: ReadCache<u32> = ReadCache::new(Duration::from_secs(60));

        let result = cache
            .get_or_compute("missing", || async {
                Err(EngineError::Database("connection refused".to_string()))
            })
            .await;
        assert!(matches!(result, Err(EngineError::Database(_))));
    }

    #[tokio::test]
    async fn test_invalidate_forces_recompute() {
        let cache: ReadCache<u32> = ReadCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        let compute = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        };
        cache.get_or_compute("k", compute).await.unwrap();
        cache.invalidate("k").await;
        cache.get_or_compute("k", compute).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
