//! # Read-Through Group Cache
//!
//! Cache layer for packed key envelopes, shared with cache peers over the
//! peer HTTP server. Entries carry their own absolute expiry; the cache
//! enforces it through a per-entry expiration policy and a get-time
//! re-check. Misses read through a constructor-injected loader callback
//! that closes over the authoritative key map, so the two layers cooperate
//! without a back-reference cycle.

use chrono::{DateTime, Utc};
use moka::future::Cache;
use moka::Expiry;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cache capacity in bytes shared with peers.
const GROUP_CACHE_BYTES: u64 = 64 << 20;

/// Loader invoked on cache miss; returns packed bytes and absolute expiry.
pub type GroupLoader = Arc<dyn Fn(&str) -> Option<(Vec<u8>, Option<DateTime<Utc>>)> + Send + Sync>;

/// A packed key envelope with its absolute expiry.
pub struct PackedEntry {
    /// Serialized key envelope
    pub bytes: Vec<u8>,
    /// Absolute expiry; `None` never expires
    pub expires_at: Option<DateTime<Utc>>,
}

impl PackedEntry {
    fn remaining(&self) -> Option<Duration> {
        let expires_at = self.expires_at?;
        Some((expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }
}

struct EntryExpiry;

impl Expiry<String, Arc<PackedEntry>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<PackedEntry>,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.remaining()
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Arc<PackedEntry>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.remaining()
    }
}

/// Peer-shared cache of packed key envelopes with read-through loading.
#[derive(Clone)]
pub struct GroupCache {
    cache: Cache<String, Arc<PackedEntry>>,
    loader: GroupLoader,
}

impl GroupCache {
    /// Create a cache backed by `loader` for misses.
    pub fn new(
        loader: impl Fn(&str) -> Option<(Vec<u8>, Option<DateTime<Utc>>)> + Send + Sync + 'static,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(GROUP_CACHE_BYTES)
            .weigher(|key: &String, value: &Arc<PackedEntry>| {
                (key.len() + value.bytes.len()).min(u32::MAX as usize) as u32
            })
            .expire_after(EntryExpiry)
            .build();

        Self {
            cache,
            loader: Arc::new(loader),
        }
    }

    /// Fetch packed bytes, reading through the loader on miss.
    ///
    /// The per-entry expiration policy evicts entries whose expiry passed;
    /// the store re-checks expiry on the decoded key, so bytes returned
    /// here may still describe a key that just expired.
    pub async fn get(&self, name: &str) -> Option<Vec<u8>> {
        let loader = Arc::clone(&self.loader);
        let lookup = name.to_string();
        let entry = self
            .cache
            .optionally_get_with(name.to_string(), async move {
                (loader)(&lookup)
                    .map(|(bytes, expires_at)| Arc::new(PackedEntry { bytes, expires_at }))
            })
            .await?;

        Some(entry.bytes.clone())
    }

    /// Insert packed bytes with an absolute expiry.
    pub async fn set(&self, name: String, bytes: Vec<u8>, expires_at: Option<DateTime<Utc>>) {
        self.cache
            .insert(name, Arc::new(PackedEntry { bytes, expires_at }))
            .await;
    }

    /// Drop an entry. Missing entries are not an error.
    pub async fn remove(&self, name: &str) {
        self.cache.invalidate(name).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    fn map_backed(
        map: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    ) -> GroupCache {
        GroupCache::new(move |name| map.lock().get(name).map(|v| (v.clone(), None)))
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let cache = map_backed(Arc::new(Mutex::new(HashMap::new())));

        cache.set("a".to_string(), b"packed".to_vec(), None).await;
        assert_eq!(cache.get("a").await, Some(b"packed".to_vec()));

        cache.remove("a").await;
        assert_eq!(cache.get("a").await, None);
    }

    #[tokio::test]
    async fn test_miss_reads_through_loader() {
        let map = Arc::new(Mutex::new(HashMap::new()));
        map.lock().insert("k".to_string(), b"from-loader".to_vec());
        let cache = map_backed(Arc::clone(&map));

        // Nothing was inserted into the cache itself
        assert_eq!(cache.get("k").await, Some(b"from-loader".to_vec()));
        assert_eq!(cache.get("missing").await, None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent_at_read() {
        let cache = map_backed(Arc::new(Mutex::new(HashMap::new())));
        let past = Utc::now() - chrono::Duration::seconds(1);

        cache.set("old".to_string(), b"stale".to_vec(), Some(past)).await;
        assert_eq!(cache.get("old").await, None);
    }
}
