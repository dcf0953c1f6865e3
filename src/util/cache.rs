use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// String-keyed cache where every entry expires independently after `ttl`.
///
/// Shared between in-flight requests; read-heavy, so reads take the read
/// half of the lock and expired entries are only swept on insert.
pub struct TtlCache<V> {
    entries: RwLock<HashMap<String, (V, Instant)>>,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some((value, inserted)) if inserted.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    pub async fn insert(&self, key: String, value: V) {
        let mut entries = self.entries.write().await;
        let ttl = self.ttl;
        entries.retain(|_, (_, inserted)| inserted.elapsed() < ttl);
        entries.insert(key, (value, Instant::now()));
        debug!("Cache now holds {} entries", entries.len());
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hit_within_ttl_and_miss_after() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_millis(30));
        cache.insert("k".to_string(), 7).await;
        assert_eq!(cache.get("k").await, Some(7));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn expired_entries_are_swept_on_insert() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_millis(10));
        cache.insert("a".to_string(), 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.insert("b".to_string(), 2).await;
        assert_eq!(cache.len().await, 1);
    }
}
