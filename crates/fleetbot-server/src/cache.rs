use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;

use tokio::sync::RwLock;

/// Compute-if-absent memoization shared across concurrent invocations.
///
/// Loads run outside the lock, so two callers racing on a cold key may both
/// load; the first value stored wins and both callers observe it.
pub struct MemoCache<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for MemoCache<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> MemoCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn get_or_load<F, Fut, E>(&self, key: &K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok(hit);
        }
        let loaded = load().await?;
        let mut entries = self.entries.write().await;
        Ok(entries.entry(key.clone()).or_insert(loaded).clone())
    }

    /// Loads unconditionally and replaces any cached value.
    pub async fn refresh<F, Fut, E>(&self, key: &K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let loaded = load().await?;
        self.entries
            .write()
            .await
            .insert(key.clone(), loaded.clone());
        Ok(loaded)
    }

    pub async fn invalidate(&self, key: &K) {
        self.entries.write().await.remove(key);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn loads_once_until_invalidated() {
        let cache: MemoCache<String, usize> = MemoCache::new();
        let loads = AtomicUsize::new(0);
        let key = "permissions".to_string();

        for _ in 0..3 {
            let value = cache
                .get_or_load(&key, || async {
                    Ok::<_, Infallible>(loads.fetch_add(1, Ordering::SeqCst) + 1)
                })
                .await
                .unwrap();
            assert_eq!(value, 1);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        cache.invalidate(&key).await;
        let value = cache
            .get_or_load(&key, || async {
                Ok::<_, Infallible>(loads.fetch_add(1, Ordering::SeqCst) + 1)
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn failed_loads_are_not_cached() {
        let cache: MemoCache<u8, u8> = MemoCache::new();
        let err = cache
            .get_or_load(&1, || async { Err::<u8, _>("boom") })
            .await
            .unwrap_err();
        assert_eq!(err, "boom");
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn refresh_replaces_cached_value() {
        let cache: MemoCache<u8, u8> = MemoCache::new();
        cache
            .get_or_load(&1, || async { Ok::<_, Infallible>(10) })
            .await
            .unwrap();
        let fresh = cache
            .refresh(&1, || async { Ok::<_, Infallible>(20) })
            .await
            .unwrap();
        assert_eq!(fresh, 20);
        assert_eq!(cache.get(&1).await, Some(20));
    }
}
