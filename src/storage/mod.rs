//! # TTL Key Cache
//!
//! Storage layer for transit keys. The authoritative copy of every key
//! lives in an in-process map; reads go through the peer-shared
//! [`GroupCache`] facade, which falls back to the authoritative map on
//! miss. A background sweeper evicts expired names on a fixed interval,
//! and `get` re-checks expiry on the unpacked key to close the race with
//! the sweeper tick.
//!
//! TTL extension flows through [`KeyStore::extend_ttl`] so the
//! read-modify-write happens under the authoritative mutex and the packed
//! envelope is re-published atomically.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::keys::{KeyError, TransitKey};

pub mod group;

pub use group::GroupCache;

/// Default sweep interval for expired-key eviction.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Key storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// No live key under the requested name
    #[error("key not found")]
    NotFound,

    /// Packing or unpacking a stored key failed
    #[error(transparent)]
    Key(#[from] KeyError),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// TTL-evicting store of named transit keys.
pub struct KeyStore {
    authoritative: Arc<Mutex<HashMap<String, TransitKey>>>,
    group: GroupCache,
    sweep_interval: Duration,
}

impl KeyStore {
    /// Create a store whose sweeper runs every `sweep_interval`.
    ///
    /// The interval is injected so tests can run the sweeper at millisecond
    /// cadence; production uses [`DEFAULT_SWEEP_INTERVAL`].
    pub fn new(sweep_interval: Duration) -> Self {
        let authoritative: Arc<Mutex<HashMap<String, TransitKey>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let loader_map = Arc::clone(&authoritative);
        let group = GroupCache::new(move |name| {
            let map = loader_map.lock();
            let key = map.get(name)?;
            tracing::debug!(key = %name, "loading packed key from authoritative map");
            Some((key.pack().ok()?, key.expires_at()))
        });

        Self {
            authoritative,
            group,
            sweep_interval,
        }
    }

    /// Store `key` under its name in both layers.
    pub async fn put(&self, key: TransitKey) -> StorageResult<()> {
        let packed = key.pack()?;
        let expires_at = key.expires_at();
        let name = key.name().to_string();

        self.authoritative.lock().insert(name.clone(), key);
        self.group.set(name, packed, expires_at).await;
        Ok(())
    }

    /// Fetch and unpack the key stored under `name`.
    ///
    /// Reads through the group cache; a key that is expired at read time is
    /// removed from both layers and reported as [`StorageError::NotFound`].
    pub async fn get(&self, name: &str) -> StorageResult<TransitKey> {
        let packed = self.group.get(name).await.ok_or(StorageError::NotFound)?;
        let key = TransitKey::unpack(&packed)?;

        if key.is_expired() {
            self.delete(name).await?;
            return Err(StorageError::NotFound);
        }

        Ok(key)
    }

    /// Fetch the packed envelope under `name` without unpacking.
    ///
    /// This is the peer-cache read path; expiry is still enforced.
    pub async fn get_packed(&self, name: &str) -> Option<Vec<u8>> {
        let packed = self.group.get(name).await?;
        match TransitKey::unpack(&packed) {
            Ok(key) if key.is_expired() => {
                let _ = self.delete(name).await;
                None
            }
            Ok(_) => Some(packed),
            Err(_) => None,
        }
    }

    /// Remove the key under `name` from both layers. Idempotent.
    pub async fn delete(&self, name: &str) -> StorageResult<()> {
        self.authoritative.lock().remove(name);
        self.group.remove(name).await;
        Ok(())
    }

    /// Replace the TTL of an existing key without regenerating material.
    ///
    /// The mutation happens under the authoritative mutex and the updated
    /// envelope is re-published to the group cache.
    pub async fn extend_ttl(&self, name: &str, ttl: Duration) -> StorageResult<()> {
        let (packed, expires_at) = {
            let mut map = self.authoritative.lock();
            let key = map.get_mut(name).ok_or(StorageError::NotFound)?;
            key.set_ttl(ttl);
            (key.pack()?, key.expires_at())
        };

        self.group.set(name.to_string(), packed, expires_at).await;
        Ok(())
    }

    /// Number of keys in the authoritative map (live or awaiting sweep).
    pub fn len(&self) -> usize {
        self.authoritative.lock().len()
    }

    /// Whether the authoritative map is empty.
    pub fn is_empty(&self) -> bool {
        self.authoritative.lock().is_empty()
    }

    /// Evict every expired key once.
    pub async fn sweep(&self) {
        let expired: Vec<String> = self
            .authoritative
            .lock()
            .iter()
            .filter(|(_, key)| key.is_expired())
            .map(|(name, _)| name.clone())
            .collect();

        for name in expired {
            tracing::debug!(key = %name, "evicting expired key");
            let _ = self.delete(&name).await;
        }
    }

    /// Spawn the periodic sweeper task for `store`.
    ///
    /// The task runs until aborted; the server lifecycle owns the handle.
    pub fn spawn_sweeper(store: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.sweep_interval);
            loop {
                ticker.tick().await;
                store.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::DEFAULT_KEY_TTL;

    fn kyber_key(name: &str, ttl: Duration) -> TransitKey {
        TransitKey::new("kyber", "512", name, ttl).unwrap()
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let store = KeyStore::new(DEFAULT_SWEEP_INTERVAL);
        let key = kyber_key("alpha", DEFAULT_KEY_TTL);
        let ciphertext = key.encrypt(b"stored secret").unwrap();

        store.put(key).await.unwrap();

        let restored = store.get("alpha").await.unwrap();
        assert_eq!(restored.name(), "alpha");
        assert_eq!(restored.decrypt(&ciphertext).unwrap(), b"stored secret");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = KeyStore::new(DEFAULT_SWEEP_INTERVAL);
        assert!(matches!(
            store.get("nope").await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = KeyStore::new(DEFAULT_SWEEP_INTERVAL);
        store.put(kyber_key("gone", DEFAULT_KEY_TTL)).await.unwrap();

        store.delete("gone").await.unwrap();
        store.delete("gone").await.unwrap();
        store.delete("never-existed").await.unwrap();

        assert!(matches!(
            store.get("gone").await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_expired_key_is_absent_at_read() {
        let store = KeyStore::new(DEFAULT_SWEEP_INTERVAL);
        store
            .put(kyber_key("short", Duration::from_millis(20)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(matches!(
            store.get("short").await,
            Err(StorageError::NotFound)
        ));
        assert_eq!(store.len(), 0, "expired key is removed on read");
    }

    #[tokio::test]
    async fn test_sweeper_evicts_expired_keys() {
        let store = Arc::new(KeyStore::new(Duration::from_millis(20)));
        store
            .put(kyber_key("fleeting", Duration::from_millis(20)))
            .await
            .unwrap();
        store.put(kyber_key("durable", Duration::ZERO)).await.unwrap();

        let sweeper = KeyStore::spawn_sweeper(&store);
        tokio::time::sleep(Duration::from_millis(100)).await;
        sweeper.abort();

        assert_eq!(store.len(), 1, "only the non-expiring key survives");
        assert!(store.get("durable").await.is_ok());
    }

    #[tokio::test]
    async fn test_extend_ttl_preserves_material() {
        let store = KeyStore::new(DEFAULT_SWEEP_INTERVAL);
        let key = kyber_key("extend", Duration::from_secs(60));
        let ciphertext = key.encrypt(b"same material").unwrap();
        store.put(key).await.unwrap();

        store
            .extend_ttl("extend", Duration::from_secs(55 * 60))
            .await
            .unwrap();

        let restored = store.get("extend").await.unwrap();
        assert_eq!(restored.ttl(), Duration::from_secs(55 * 60));
        assert_eq!(restored.decrypt(&ciphertext).unwrap(), b"same material");
    }

    #[tokio::test]
    async fn test_extend_ttl_missing_is_not_found() {
        let store = KeyStore::new(DEFAULT_SWEEP_INTERVAL);
        assert!(matches!(
            store.extend_ttl("nope", Duration::from_secs(60)).await,
            Err(StorageError::NotFound)
        ));
    }
}
