//! Persistent key-material storage.
//!
//! The session reads and writes key records through the [`KeyStore`]
//! trait; callers plug in whatever backing store the application uses.
//! [`KeyTransaction`] layers read caching and write buffering on top, so
//! a multi-step operation touches the store once, as a batch.

use std::collections::HashMap;
use std::future::Future;

use tokio::sync::Mutex;

use crate::core::SessionError;

/// Namespaced binary key/value storage for session key material.
///
/// A batch passed to [`put_many`] must apply atomically: concurrent
/// readers see all of it or none of it.
///
/// [`put_many`]: KeyStore::put_many
pub trait KeyStore: Send + Sync + 'static {
    /// Fetch values for `keys` in `namespace`, positionally.
    fn get_many(
        &self,
        namespace: &str,
        keys: &[String],
    ) -> impl Future<Output = Result<Vec<Option<Vec<u8>>>, SessionError>> + Send;

    /// Apply a batch of writes to `namespace`. `None` deletes the key.
    fn put_many(
        &self,
        namespace: &str,
        entries: Vec<(String, Option<Vec<u8>>)>,
    ) -> impl Future<Output = Result<(), SessionError>> + Send;
}

/// Buffered view over a [`KeyStore`].
///
/// Reads are cached and see earlier writes made through the same
/// transaction; nothing reaches the store until [`commit`].
///
/// [`commit`]: KeyTransaction::commit
pub struct KeyTransaction<'a, S: KeyStore> {
    store: &'a S,
    cache: HashMap<(String, String), Option<Vec<u8>>>,
    // Ordered so later writes to the same key win at commit.
    writes: Vec<(String, String, Option<Vec<u8>>)>,
}

impl<'a, S: KeyStore> KeyTransaction<'a, S> {
    /// Start an empty transaction over `store`.
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            cache: HashMap::new(),
            writes: Vec::new(),
        }
    }

    /// Read one key, preferring buffered writes, then the cache, then
    /// the store.
    pub async fn get(&mut self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, SessionError> {
        if let Some((_, _, value)) = self
            .writes
            .iter()
            .rev()
            .find(|(ns, k, _)| ns == namespace && k == key)
        {
            return Ok(value.clone());
        }
        let cache_key = (namespace.to_string(), key.to_string());
        if let Some(value) = self.cache.get(&cache_key) {
            return Ok(value.clone());
        }
        let fetched = self
            .store
            .get_many(namespace, std::slice::from_ref(&cache_key.1))
            .await?
            .into_iter()
            .next()
            .flatten();
        self.cache.insert(cache_key, fetched.clone());
        Ok(fetched)
    }

    /// Buffer a write.
    pub fn put(&mut self, namespace: &str, key: &str, value: Vec<u8>) {
        self.writes
            .push((namespace.to_string(), key.to_string(), Some(value)));
    }

    /// Buffer a deletion.
    pub fn delete(&mut self, namespace: &str, key: &str) {
        self.writes
            .push((namespace.to_string(), key.to_string(), None));
    }

    /// Flush buffered writes to the store, one batch per namespace.
    pub async fn commit(self) -> Result<(), SessionError> {
        let mut by_namespace: HashMap<String, Vec<(String, Option<Vec<u8>>)>> = HashMap::new();
        for (namespace, key, value) in self.writes {
            by_namespace
                .entry(namespace)
                .or_default()
                .push((key, value));
        }
        for (namespace, entries) in by_namespace {
            self.store.put_many(&namespace, entries).await?;
        }
        Ok(())
    }
}

/// In-memory [`KeyStore`] for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryKeyStore {
    namespaces: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl MemoryKeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    async fn get_many(
        &self,
        namespace: &str,
        keys: &[String],
    ) -> Result<Vec<Option<Vec<u8>>>, SessionError> {
        let namespaces = self.namespaces.lock().await;
        let records = namespaces.get(namespace);
        Ok(keys
            .iter()
            .map(|key| records.and_then(|r| r.get(key).cloned()))
            .collect())
    }

    async fn put_many(
        &self,
        namespace: &str,
        entries: Vec<(String, Option<Vec<u8>>)>,
    ) -> Result<(), SessionError> {
        // One guard across the whole batch keeps it atomic.
        let mut namespaces = self.namespaces.lock().await;
        let records = namespaces.entry(namespace.to_string()).or_default();
        for (key, value) in entries {
            match value {
                Some(value) => {
                    records.insert(key, value);
                }
                None => {
                    records.remove(&key);
                }
            }
        }
        Ok(())
    }
}
