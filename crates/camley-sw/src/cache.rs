//! Cache Storage: versioned named stores mapping requests to captured
//! responses.

use crate::{now_millis, ServiceWorkerError};
use async_trait::async_trait;
use bytes::Bytes;
use camley_net::{Request, Response, ResponseType, Url};
use hashbrown::HashMap;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

// ==================== Keys ====================

/// Cache key: method plus URL with the fragment removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url: url.to_string(),
        }
    }

    pub fn from_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }
}

// ==================== Entries ====================

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL (fragment stripped).
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
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,

    /// Request header values named by the response's `Vary` header.
    #[serde(default)]
    pub vary: HashMap<String, Option<String>>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

const VARY_ANY: &str = "*";

impl CacheEntry {
    /// Capture a response for the given request.
    pub fn capture(request: &Request, response: &Response) -> Self {
        let key = RequestKey::from_request(request);

        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let mut vary = HashMap::new();
        for value in response.headers.get_all(header::VARY) {
            let Ok(value) = value.to_str() else { continue };
            for name in value.split(',').map(|n| n.trim().to_ascii_lowercase()) {
                if name.is_empty() {
                    continue;
                }
                if name == VARY_ANY {
                    vary.insert(name, None);
                    continue;
                }
                let sent = request
                    .headers
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                vary.insert(name, sent);
            }
        }

        Self {
            url: key.url,
            method: key.method,
            status: response.status.as_u16(),
            status_text: response.status_text.clone(),
            headers,
            body: response.body.to_vec(),
            vary,
            cached_at: now_millis(),
        }
    }

    pub fn key(&self) -> RequestKey {
        RequestKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }

    /// Whether the request carries the header values this entry was stored
    /// under. `Vary: *` never matches.
    pub fn matches_vary(&self, request: &Request) -> bool {
        if self.vary.contains_key(VARY_ANY) {
            return false;
        }
        self.vary.iter().all(|(name, expected)| {
            let sent = request
                .headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok());
            sent == expected.as_deref()
        })
    }

    /// Rebuild a response from this entry.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(n, v);
            }
        }

        Response {
            url: Url::parse(&self.url).ok(),
            status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            status_text: self.status_text.clone(),
            headers,
            body: Bytes::from(self.body.clone()),
            response_type: ResponseType::Basic,
            redirected: false,
        }
    }
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ==================== Cache ====================

/// A cache instance.
#[derive(Debug, Clone, Default)]
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
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.entries
            .get(&RequestKey::from_request(request))
            .filter(|entry| entry.matches_vary(request))
    }

    /// Store an entry, replacing any previous one under the same key.
    pub fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.key(), entry);
    }

    /// Store several entries.
    pub fn put_all(&mut self, entries: impl IntoIterator<Item = CacheEntry>) {
        for entry in entries {
            self.put(entry);
        }
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &RequestKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<&RequestKey> {
        let mut keys: Vec<_> = self.entries.keys().collect();
        keys.sort();
        keys
    }

    /// All entries, sorted by key.
    pub fn entries(&self) -> Vec<&CacheEntry> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by(|a, b| (&a.url, &a.method).cmp(&(&b.url, &b.method)));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

/// All named caches of one origin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "StorageSnapshot", into = "StorageSnapshot")]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
    /// Creation order, for `keys()` and cross-cache matching.
    order: Vec<String>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        if !self.caches.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.order.retain(|n| n != name);
        self.caches.remove(name).is_some()
    }

    /// Cache names in creation order.
    pub fn keys(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    /// Match across all caches, oldest first.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.order
            .iter()
            .filter_map(|name| self.caches.get(name))
            .find_map(|cache| cache.match_request(request))
    }
}

#[derive(Serialize, Deserialize)]
struct CacheSnapshot {
    name: String,
    entries: Vec<CacheEntry>,
}

#[derive(Serialize, Deserialize)]
struct StorageSnapshot {
    caches: Vec<CacheSnapshot>,
}

impl From<CacheStorage> for StorageSnapshot {
    fn from(storage: CacheStorage) -> Self {
        let CacheStorage { mut caches, order } = storage;
        let caches = order
            .iter()
            .filter_map(|name| caches.remove(name))
            .map(|cache| {
                let mut entries: Vec<_> = cache.entries.into_values().collect();
                entries.sort_by(|a, b| (&a.url, &a.method).cmp(&(&b.url, &b.method)));
                CacheSnapshot {
                    name: cache.name,
                    entries,
                }
            })
            .collect();
        Self { caches }
    }
}

impl From<StorageSnapshot> for CacheStorage {
    fn from(snapshot: StorageSnapshot) -> Self {
        let mut storage = CacheStorage::new();
        for cache in snapshot.caches {
            storage.open(&cache.name).put_all(cache.entries);
        }
        storage
    }
}

// ==================== Store seam ====================

/// The worker's view of cache storage. Each call is atomic: it either
/// fully applies or leaves the storage untouched.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Create the named cache if it does not exist.
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError>;

    async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// Cache names in creation order.
    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError>;

    /// Delete a whole cache. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// Match a request across all caches.
    async fn match_request(&self, request: &Request)
        -> Result<Option<CacheEntry>, ServiceWorkerError>;

    /// Store one entry in the named cache, creating the cache if needed.
    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), ServiceWorkerError>;

    /// Store all entries in the named cache, or none of them.
    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>)
        -> Result<(), ServiceWorkerError>;

    /// Entries of one cache, sorted by key.
    async fn entries(&self, name: &str) -> Result<Vec<CacheEntry>, ServiceWorkerError>;
}

/// In-memory cache store.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    storage: RwLock<CacheStorage>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_storage(storage: CacheStorage) -> Self {
        Self {
            storage: RwLock::new(storage),
        }
    }

    /// Copy of the current storage.
    pub async fn snapshot(&self) -> CacheStorage {
        self.storage.read().await.clone()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn open(&self, name: &str) -> Result<(), ServiceWorkerError> {
        self.storage.write().await.open(name);
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        Ok(self.storage.read().await.has(name))
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        Ok(self
            .storage
            .read()
            .await
            .keys()
            .into_iter()
            .map(String::from)
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        Ok(self.storage.write().await.delete(name))
    }

    async fn match_request(
        &self,
        request: &Request,
    ) -> Result<Option<CacheEntry>, ServiceWorkerError> {
        Ok(self.storage.read().await.match_request(request).cloned())
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), ServiceWorkerError> {
        self.storage.write().await.open(name).put(entry);
        Ok(())
    }

    async fn put_all(
        &self,
        name: &str,
        entries: Vec<CacheEntry>,
    ) -> Result<(), ServiceWorkerError> {
        self.storage.write().await.open(name).put_all(entries);
        Ok(())
    }

    async fn entries(&self, name: &str) -> Result<Vec<CacheEntry>, ServiceWorkerError> {
        Ok(self
            .storage
            .read()
            .await
            .get(name)
            .map(|cache| cache.entries().into_iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    fn ok_response(body: &'static str) -> Response {
        Response {
            url: None,
            status: StatusCode::OK,
            status_text: "OK".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(body.as_bytes()),
            response_type: ResponseType::Basic,
            redirected: false,
        }
    }

    #[test]
    fn test_key_strips_fragment() {
        let a = RequestKey::from_request(&get("https://example.com/login#top"));
        let b = RequestKey::from_request(&get("https://example.com/login"));
        assert_eq!(a, b);
        assert_eq!(a.method, "GET");
    }

    #[test]
    fn test_cache_put_and_match() {
        let mut cache = Cache::new("v1");
        let request = get("https://example.com/static/css/style.css");
        cache.put(CacheEntry::capture(&request, &ok_response("body{}")));

        let hit = cache.match_request(&request).unwrap();
        assert_eq!(hit.body, b"body{}");
        assert!(cache.match_request(&get("https://example.com/other.css")).is_none());
    }

    #[test]
    fn test_match_is_per_method() {
        let mut cache = Cache::new("v1");
        let request = get("https://example.com/");
        cache.put(CacheEntry::capture(&request, &ok_response("home")));

        let head = get("https://example.com/").method(Method::HEAD);
        assert!(cache.match_request(&head).is_none());
    }

    #[test]
    fn test_vary_header_matching() {
        let mut response = ok_response("es");
        response
            .headers
            .insert(header::VARY, HeaderValue::from_static("Accept-Language"));
        let spanish = get("https://example.com/").header(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("es"),
        );

        let mut cache = Cache::new("v1");
        cache.put(CacheEntry::capture(&spanish, &response));

        assert!(cache.match_request(&spanish).is_some());
        let english = get("https://example.com/").header(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en"),
        );
        assert!(cache.match_request(&english).is_none());
    }

    #[test]
    fn test_vary_star_never_matches() {
        let mut response = ok_response("x");
        response.headers.insert(header::VARY, HeaderValue::from_static("*"));
        let request = get("https://example.com/");

        let mut cache = Cache::new("v1");
        cache.put(CacheEntry::capture(&request, &response));
        assert!(cache.match_request(&request).is_none());
    }

    #[test]
    fn test_entry_to_response() {
        let mut response = ok_response("a{}");
        response
            .headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/css"));
        let request = get("https://example.com/a.css");
        let entry = CacheEntry::capture(&request, &response);

        let rebuilt = entry.to_response();
        assert_eq!(rebuilt.status, StatusCode::OK);
        assert_eq!(rebuilt.body, Bytes::from_static(b"a{}"));
        assert_eq!(rebuilt.headers.get(header::CONTENT_TYPE).unwrap(), "text/css");
    }

    #[test]
    fn test_cache_delete() {
        let mut cache = Cache::new("v1");
        let request = get("https://example.com/a.js");
        cache.put(CacheEntry::capture(&request, &ok_response("")));

        assert!(cache.delete(&RequestKey::from_request(&request)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_storage_order() {
        let mut storage = CacheStorage::new();
        storage.open("camley-transporte-v1.0");
        storage.open("camley-transporte-v2.1");
        storage.open("camley-transporte-v1.0");

        assert_eq!(
            storage.keys(),
            vec!["camley-transporte-v1.0", "camley-transporte-v2.1"]
        );
        assert!(storage.delete("camley-transporte-v1.0"));
        assert!(!storage.has("camley-transporte-v1.0"));
        assert_eq!(storage.keys(), vec!["camley-transporte-v2.1"]);
    }

    #[test]
    fn test_storage_snapshot_json() {
        let mut storage = CacheStorage::new();
        let request = get("https://example.com/");
        storage
            .open("v1")
            .put(CacheEntry::capture(&request, &ok_response("<html>")));
        storage.open("v2");

        let json = serde_json::to_string(&storage).unwrap();
        let restored: CacheStorage = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.keys(), vec!["v1", "v2"]);
        assert_eq!(restored.match_request(&request).unwrap().body, b"<html>");
    }

    #[tokio::test]
    async fn test_memory_store_match_across_caches() {
        let store = MemoryCacheStore::new();
        let request = get("https://example.com/login");
        store
            .put("old", CacheEntry::capture(&request, &ok_response("old")))
            .await
            .unwrap();
        store.open("new").await.unwrap();

        let hit = store.match_request(&request).await.unwrap().unwrap();
        assert_eq!(hit.body, b"old");
        assert_eq!(store.keys().await.unwrap(), vec!["old", "new"]);
        assert!(store.entries("new").await.unwrap().is_empty());
        assert!(store.entries("missing").await.unwrap().is_empty());
    }
}
