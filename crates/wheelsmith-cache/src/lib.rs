//! The link-page cache.
//!
//! Pages are cached under keys that embed a version vector: one
//! monotonically incrementing serial per (index, package). Invalidation
//! bumps a serial, which silently retires every key derived from the old
//! vector; nothing is ever deleted or scanned.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::trace;

use wheelsmith_normalize::PackageSlug;

/// Storage the page cache runs on. A shared deployment would back this
/// with a memcached-style store; misses are always acceptable, so
/// backends are infallible and degrade to "not cached" on trouble.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Read several counters in one atomic multi-get.
    async fn get_many(&self, keys: &[String]) -> Vec<Option<u64>>;

    /// Increment a counter, initializing it to 1 when absent.
    async fn incr(&self, key: &str);

    async fn get_page(&self, key: &str) -> Option<Vec<u8>>;

    async fn set_page(&self, key: &str, body: Vec<u8>);
}

/// In-process backend: a single mutex over both maps, which makes the
/// multi-get trivially atomic.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    serials: HashMap<String, u64>,
    pages: HashMap<String, Vec<u8>>,
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get_many(&self, keys: &[String]) -> Vec<Option<u64>> {
        let inner = self.inner.lock().unwrap();
        keys.iter().map(|key| inner.serials.get(key).copied()).collect()
    }

    async fn incr(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        *inner.serials.entry(key.to_string()).or_insert(0) += 1;
    }

    async fn get_page(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().pages.get(key).cloned()
    }

    async fn set_page(&self, key: &str, body: Vec<u8>) {
        self.inner.lock().unwrap().pages.insert(key.to_string(), body);
    }
}

/// The versioned page cache served to installers.
#[derive(Clone)]
pub struct PageCache {
    backend: Arc<dyn CacheBackend>,
}

impl PageCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    fn serial_key(index_slug: &str, package: &PackageSlug) -> String {
        format!("serial/index:{index_slug}/package:{package}")
    }

    /// The full cache key for a rendered page: namespace, index set in
    /// declared order, platform, package, and the current version vector.
    ///
    /// The vector reads the per-(index, package) serials through one
    /// atomic multi-get, over the *sorted* serial-key list so that the
    /// same index set always produces the same vector layout.
    pub async fn page_key(
        &self,
        index_slugs: &[String],
        platform_slug: &str,
        package: &PackageSlug,
    ) -> String {
        let mut serial_keys: Vec<String> = index_slugs
            .iter()
            .map(|slug| Self::serial_key(slug, package))
            .collect();
        serial_keys.sort();
        let serials = self.backend.get_many(&serial_keys).await;
        let vector = serials
            .iter()
            .map(|serial| serial.unwrap_or(0).to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "links/indexes:{}/platform:{}/package:{}/v:{}",
            index_slugs.join("+"),
            platform_slug,
            package,
            vector,
        )
    }

    /// Retire every cached view of this package on this index.
    pub async fn invalidate(&self, index_slug: &str, package: &PackageSlug) {
        let key = Self::serial_key(index_slug, package);
        trace!(%key, "bumping link-page serial");
        self.backend.incr(&key).await;
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.backend.get_page(key).await
    }

    pub async fn put(&self, key: &str, body: Vec<u8>) {
        self.backend.set_page(key, body).await;
    }
}
