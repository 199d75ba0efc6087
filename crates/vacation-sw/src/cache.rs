//! Named cache generations.
//!
//! A [`CacheStore`] holds any number of generations, each mapping a
//! [`RequestKey`] to a stored response. The worker only ever reads and
//! writes the generation named after its own version; activation deletes
//! the rest.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::trace;

use crate::error::CacheError;
use crate::request::RequestKey;

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response status text.
    pub status_text: String,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

/// Async named-cache capability.
///
/// Every operation may suspend and must be safe to call from concurrent
/// fetches. Single-key operations are atomic; racing writers to one key
/// resolve as last write wins.
#[async_trait]
pub trait CacheStore: Send + Sync + fmt::Debug {
    /// Open a generation, creating it if absent.
    async fn open(&self, name: &str) -> Result<(), CacheError>;

    /// Match a request in one generation. A missing generation matches nothing.
    async fn match_request(
        &self,
        name: &str,
        key: &RequestKey,
    ) -> Result<Option<CacheEntry>, CacheError>;

    /// Store an entry, replacing any previous one for the same key.
    async fn put(&self, name: &str, key: RequestKey, entry: CacheEntry) -> Result<(), CacheError>;

    /// Delete a whole generation. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, CacheError>;

    /// Names of all generations, sorted.
    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    /// Request keys stored in one generation, sorted.
    async fn entries(&self, name: &str) -> Result<Vec<RequestKey>, CacheError>;
}

/// A single cache generation.
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries.
    entries: HashMap<RequestKey, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request.
    pub fn match_request(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Add entry.
    pub fn put(&mut self, key: RequestKey, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get all keys, sorted.
    pub fn keys(&self) -> Vec<RequestKey> {
        let mut keys: Vec<_> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// In-memory cache storage.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    caches: RwLock<HashMap<String, Cache>>,
}

impl MemoryCacheStore {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn open(&self, name: &str) -> Result<(), CacheError> {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        Ok(())
    }

    async fn match_request(
        &self,
        name: &str,
        key: &RequestKey,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let caches = self.caches.read().await;
        let entry = caches
            .get(name)
            .and_then(|cache| cache.match_request(key))
            .cloned();
        trace!(cache = name, %key, hit = entry.is_some(), "Cache match");
        Ok(entry)
    }

    async fn put(&self, name: &str, key: RequestKey, entry: CacheEntry) -> Result<(), CacheError> {
        trace!(cache = name, %key, "Cache put");
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
            .put(key, entry);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut names: Vec<_> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn entries(&self, name: &str) -> Result<Vec<RequestKey>, CacheError> {
        self.caches
            .read()
            .await
            .get(name)
            .map(Cache::keys)
            .ok_or_else(|| CacheError::GenerationNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::FetchResponse;
    use url::Url;

    fn key(path: &str) -> RequestKey {
        RequestKey::get(&Url::parse("https://example.com/").unwrap().join(path).unwrap())
    }

    fn entry(key: &RequestKey, body: &'static str) -> CacheEntry {
        FetchResponse::new(200, body).to_entry(key)
    }

    #[test]
    fn test_cache() {
        let mut cache = Cache::new("vacation-tracker-v1");
        let style = key("style.css");

        cache.put(style.clone(), entry(&style, "body {}"));

        assert!(cache.match_request(&style).is_some());
        assert!(cache.match_request(&key("other.css")).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_keys() {
        let mut cache = Cache::new("test");
        let b = key("b.js");
        let a = key("a.js");
        cache.put(b.clone(), entry(&b, "b"));
        cache.put(a.clone(), entry(&a, "a"));

        assert_eq!(cache.keys(), vec![a, b]);
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let store = MemoryCacheStore::new();
        let index = key("index.html");

        store.open("v1").await.unwrap();
        store.put("v1", index.clone(), entry(&index, "<html>")).await.unwrap();
        store.open("v1").await.unwrap();

        assert_eq!(store.keys().await.unwrap(), vec!["v1".to_string()]);
        assert!(store.match_request("v1", &index).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let store = MemoryCacheStore::new();
        let data = key("vacationtracker.json");

        store.put("v1", data.clone(), entry(&data, "old")).await.unwrap();
        store.put("v1", data.clone(), entry(&data, "new")).await.unwrap();

        let stored = store.match_request("v1", &data).await.unwrap().unwrap();
        assert_eq!(stored.body, Bytes::from_static(b"new"));
        assert_eq!(store.entries("v1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_generations_are_isolated() {
        let store = MemoryCacheStore::new();
        let app = key("app.js");

        store.put("v1", app.clone(), entry(&app, "one")).await.unwrap();
        store.open("v2").await.unwrap();

        assert!(store.match_request("v2", &app).await.unwrap().is_none());
        assert!(store.match_request("missing", &app).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryCacheStore::new();
        store.open("v1").await.unwrap();

        assert!(store.delete("v1").await.unwrap());
        assert!(!store.delete("v1").await.unwrap());
        assert!(store.keys().await.unwrap().is_empty());
        assert_eq!(
            store.entries("v1").await,
            Err(CacheError::GenerationNotFound("v1".into()))
        );
    }
}
