//! Poster image loading with a bounded in-memory cache
//!
//! Images are cached as raw bytes; decoding is left to the host UI. The
//! cache evicts least recently used entries once either the entry count or
//! the total byte size exceeds its limit.

use crate::config::DownloadConfig;
use crate::error::{OfflineError, Result};
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use reqwest::Client;
use std::num::NonZeroUsize;
use url::Url;

/// LRU cache bounded by entry count and total bytes
#[derive(Debug)]
pub struct ImageCache {
    entries: LruCache<Url, Bytes>,
    max_bytes: usize,
    total_bytes: usize,
}

impl ImageCache {
    pub fn new(capacity: usize, max_bytes: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            max_bytes,
            total_bytes: 0,
        }
    }

    pub fn get(&mut self, url: &Url) -> Option<Bytes> {
        self.entries.get(url).cloned()
    }

    /// Insert an image, evicting older ones as needed.
    ///
    /// Images larger than the byte budget are not cached at all.
    pub fn insert(&mut self, url: Url, data: Bytes) {
        if data.len() > self.max_bytes {
            return;
        }

        self.total_bytes += data.len();
        // Either the replaced value or the entry evicted for capacity
        if let Some((_, displaced)) = self.entries.push(url, data) {
            self.total_bytes -= displaced.len();
        }

        while self.total_bytes > self.max_bytes {
            let Some((_, evicted)) = self.entries.pop_lru() else {
                break;
            };
            self.total_bytes -= evicted.len();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }
}

/// Downloads images and caches them for quicker access
pub struct ImageLoader {
    client: Client,
    cache: Mutex<ImageCache>,
}

impl ImageLoader {
    pub fn new(client: Client, capacity: usize, max_bytes: usize) -> Self {
        Self {
            client,
            cache: Mutex::new(ImageCache::new(capacity, max_bytes)),
        }
    }

    pub fn from_config(client: Client, config: &DownloadConfig) -> Self {
        Self::new(client, config.image_cache_capacity, config.image_cache_max_bytes)
    }

    /// Cached image, if present
    pub fn cached(&self, url: &Url) -> Option<Bytes> {
        self.cache.lock().get(url)
    }

    /// Load an image, serving it from the cache when possible
    pub async fn load(&self, url: &Url) -> Result<Bytes> {
        if let Some(data) = self.cached(url) {
            return Ok(data);
        }

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(OfflineError::transport)?;

        if !response.status().is_success() {
            return Err(OfflineError::UnexpectedStatusCode {
                status_code: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let data = response.bytes().await.map_err(OfflineError::transport)?;
        if data.is_empty() {
            return Err(OfflineError::EmptyPayload(url.to_string()));
        }

        self.cache.lock().insert(url.clone(), data.clone());
        Ok(data)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn url(name: &str) -> Url {
        Url::parse(&format!("https://img.example.com/{}.jpg", name)).unwrap()
    }

    #[test]
    fn test_count_eviction_is_lru() {
        let mut cache = ImageCache::new(2, 1024);
        cache.insert(url("a"), Bytes::from_static(b"aa"));
        cache.insert(url("b"), Bytes::from_static(b"bb"));

        // Touch "a" so "b" becomes the oldest
        assert!(cache.get(&url("a")).is_some());
        cache.insert(url("c"), Bytes::from_static(b"cc"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&url("b")).is_none());
        assert!(cache.get(&url("a")).is_some());
        assert!(cache.get(&url("c")).is_some());
    }

    #[test]
    fn test_byte_budget() {
        let mut cache = ImageCache::new(10, 5);
        cache.insert(url("a"), Bytes::from_static(b"123"));
        cache.insert(url("b"), Bytes::from_static(b"456"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 3);

        cache.insert(url("huge"), Bytes::from_static(b"0123456789"));
        assert!(cache.get(&url("huge")).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_replacing_entry_updates_size() {
        let mut cache = ImageCache::new(4, 100);
        cache.insert(url("a"), Bytes::from_static(b"1234"));
        cache.insert(url("a"), Bytes::from_static(b"12"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 2);
    }

    #[test]
    fn test_byte_budget_evicts_oldest_first() {
        let mut cache = ImageCache::new(10, 6);
        cache.insert(url("a"), Bytes::from_static(b"12"));
        cache.insert(url("b"), Bytes::from_static(b"34"));
        cache.insert(url("c"), Bytes::from_static(b"56"));
        assert!(cache.get(&url("a")).is_some());

        cache.insert(url("d"), Bytes::from_static(b"78"));
        assert!(cache.get(&url("b")).is_none());
        assert!(cache.get(&url("a")).is_some());
        assert_eq!(cache.total_bytes(), 6);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[tokio::test]
    async fn test_loader_caches_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/poster.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let loader = ImageLoader::new(Client::new(), 4, 1024);
        let url = Url::parse(&format!("{}/poster.jpg", server.uri())).unwrap();

        assert_eq!(loader.load(&url).await.unwrap(), Bytes::from_static(b"jpeg"));
        assert_eq!(loader.load(&url).await.unwrap(), Bytes::from_static(b"jpeg"));
        assert_eq!(loader.len(), 1);
    }

    #[tokio::test]
    async fn test_loader_reports_missing_image() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let loader = ImageLoader::new(Client::new(), 4, 1024);
        let url = Url::parse(&format!("{}/missing.jpg", server.uri())).unwrap();

        let err = loader.load(&url).await.unwrap_err();
        assert!(matches!(err, OfflineError::UnexpectedStatusCode { status_code: 404, .. }));
        assert!(loader.is_empty());
    }

    #[tokio::test]
    async fn test_loader_classifies_connection_failure() {
        // Nothing listens on port 9 of localhost
        let loader = ImageLoader::new(Client::new(), 4, 1024);
        let url = Url::parse("http://127.0.0.1:9/poster.jpg").unwrap();

        let err = loader.load(&url).await.unwrap_err();
        assert!(
            matches!(err, OfflineError::NetworkError { is_transient: true, .. }),
            "{:?}",
            err
        );
        assert!(err.is_transport_error());
    }
}
