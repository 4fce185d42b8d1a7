//! ============================================================================
//! Image Source Cache - Memoized display handles for embedded-db images
//! ============================================================================
//! Embedded-db images are displayed through `blob:studio/<uuid>` handles whose
//! bytes live in a `HandleRegistry`. The cache maps filenames to handles with
//! bounded least-recently-used eviction. A handle is revoked whenever its
//! cache entry goes away (eviction, invalidation, clear, drop).
//! ============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Default number of memoized handles
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Prefix of every allocated handle
pub const HANDLE_PREFIX: &str = "blob:studio/";

/// Live handle allocations
#[derive(Debug, Default)]
pub struct HandleRegistry {
    handles: StdRwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new handle for `bytes`
    pub fn allocate(&self, bytes: Vec<u8>) -> String {
        let handle = format!("{}{}", HANDLE_PREFIX, Uuid::new_v4());
        self.handles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.clone(), Arc::new(bytes));
        handle
    }

    /// Bytes behind a live handle
    pub fn get(&self, handle: &str) -> Option<Arc<Vec<u8>>> {
        self.handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(handle)
            .cloned()
    }

    /// Release a handle; returns false if it was already gone
    pub fn revoke(&self, handle: &str) -> bool {
        self.handles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(handle)
            .is_some()
    }

    pub fn is_live(&self, handle: &str) -> bool {
        self.handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(handle)
    }

    pub fn live_count(&self) -> usize {
        self.handles.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[derive(Debug, Clone)]
struct CachedHandle {
    handle: String,
    last_used: u64,
}

/// Filename to handle memoization with LRU eviction
pub struct ImageSourceCache {
    registry: Arc<HandleRegistry>,
    entries: RwLock<HashMap<String, CachedHandle>>,
    capacity: usize,
    clock: AtomicU64,
}

impl ImageSourceCache {
    pub fn new(registry: Arc<HandleRegistry>, capacity: usize) -> Self {
        Self {
            registry,
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Cached handle for `filename`, refreshing its recency
    pub async fn get(&self, filename: &str) -> Option<String> {
        let mut entries = self.entries.write().await;
        let now = self.tick();
        entries.get_mut(filename).map(|entry| {
            entry.last_used = now;
            entry.handle.clone()
        })
    }

    /// Return the cached handle, or load the bytes and allocate one.
    /// `Ok(None)` when the loader finds nothing.
    pub async fn get_or_load<F, E>(&self, filename: &str, load: F) -> Result<Option<String>, E>
    where
        F: FnOnce() -> Result<Option<Vec<u8>>, E>,
    {
        if let Some(handle) = self.get(filename).await {
            debug!("Image source cache hit: {}", filename);
            return Ok(Some(handle));
        }

        let Some(bytes) = load()? else {
            return Ok(None);
        };

        let mut entries = self.entries.write().await;
        let now = self.tick();
        // A concurrent caller may have filled the slot while we were loading
        if let Some(entry) = entries.get_mut(filename) {
            entry.last_used = now;
            return Ok(Some(entry.handle.clone()));
        }

        if entries.len() >= self.capacity {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, v)| v.last_used)
                .map(|(k, _)| k.clone())
            {
                if let Some(evicted) = entries.remove(&oldest) {
                    self.registry.revoke(&evicted.handle);
                    debug!("Evicted image source handle for {}", oldest);
                }
            }
        }

        let handle = self.registry.allocate(bytes);
        entries.insert(
            filename.to_string(),
            CachedHandle {
                handle: handle.clone(),
                last_used: now,
            },
        );
        debug!("Allocated image source handle for {}", filename);
        Ok(Some(handle))
    }

    /// Drop one entry and revoke its handle
    pub async fn invalidate(&self, filename: &str) -> bool {
        let removed = self.entries.write().await.remove(filename);
        match removed {
            Some(entry) => {
                self.registry.revoke(&entry.handle);
                true
            }
            None => false,
        }
    }

    /// Drop every entry and revoke all handles
    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        for (_, entry) in entries.drain() {
            self.registry.revoke(&entry.handle);
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Drop for ImageSourceCache {
    fn drop(&mut self) {
        for (_, entry) in self.entries.get_mut().drain() {
            self.registry.revoke(&entry.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn loader(bytes: &'static [u8]) -> impl FnOnce() -> Result<Option<Vec<u8>>, Infallible> {
        move || Ok(Some(bytes.to_vec()))
    }

    #[tokio::test]
    async fn test_memoizes_handles() {
        let registry = Arc::new(HandleRegistry::new());
        let cache = ImageSourceCache::new(registry.clone(), 4);

        let first = cache.get_or_load("a.png", loader(b"a")).await.unwrap().unwrap();
        assert!(first.starts_with(HANDLE_PREFIX));
        let second = cache
            .get_or_load("a.png", || -> Result<_, Infallible> { panic!("loader must not run on a hit") })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.get(&first).unwrap().as_slice(), b"a");
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_cached() {
        let cache = ImageSourceCache::new(Arc::new(HandleRegistry::new()), 4);
        let result = cache
            .get_or_load("gone.png", || -> Result<_, Infallible> { Ok(None) })
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_eviction_revokes_least_recently_used() {
        let registry = Arc::new(HandleRegistry::new());
        let cache = ImageSourceCache::new(registry.clone(), 2);

        let a = cache.get_or_load("a", loader(b"a")).await.unwrap().unwrap();
        let b = cache.get_or_load("b", loader(b"b")).await.unwrap().unwrap();
        // Touch `a` so `b` becomes the eviction candidate
        assert_eq!(cache.get("a").await.as_deref(), Some(a.as_str()));
        let c = cache.get_or_load("c", loader(b"c")).await.unwrap().unwrap();

        assert_eq!(cache.len().await, 2);
        assert!(registry.is_live(&a));
        assert!(!registry.is_live(&b));
        assert!(registry.is_live(&c));
        assert_eq!(registry.live_count(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_clear_and_drop_release_handles() {
        let registry = Arc::new(HandleRegistry::new());
        let cache = ImageSourceCache::new(registry.clone(), 8);

        let a = cache.get_or_load("a", loader(b"a")).await.unwrap().unwrap();
        assert!(cache.invalidate("a").await);
        assert!(!cache.invalidate("a").await);
        assert!(!registry.is_live(&a));

        cache.get_or_load("b", loader(b"b")).await.unwrap();
        cache.get_or_load("c", loader(b"c")).await.unwrap();
        cache.clear().await;
        assert_eq!(registry.live_count(), 0);

        cache.get_or_load("d", loader(b"d")).await.unwrap();
        assert_eq!(registry.live_count(), 1);
        drop(cache);
        assert_eq!(registry.live_count(), 0);
    }
}
