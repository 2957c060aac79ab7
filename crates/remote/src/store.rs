//! Key/value blob storage keyed by hex digest

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A thread-safe blob store
pub trait SimpleBlobStore: Send + Sync {
    /// Whether a blob is stored under `key`
    fn contains_key(&self, key: &str) -> bool;

    /// The blob stored under `key`
    fn get(&self, key: &str) -> Option<Arc<[u8]>>;

    /// Store `value` under `key`, replacing any previous value
    fn put(&self, key: String, value: Vec<u8>);
}

/// In-memory [`SimpleBlobStore`]
#[derive(Debug, Default)]
pub struct ConcurrentMapBlobStore {
    blobs: RwLock<HashMap<String, Arc<[u8]>>>,
}

impl ConcurrentMapBlobStore {
    /// An empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.read().map_or(0, |blobs| blobs.len())
    }

    /// Whether no blob is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SimpleBlobStore for ConcurrentMapBlobStore {
    fn contains_key(&self, key: &str) -> bool {
        self.blobs
            .read()
            .map_or(false, |blobs| blobs.contains_key(key))
    }

    fn get(&self, key: &str) -> Option<Arc<[u8]>> {
        self.blobs.read().ok()?.get(key).cloned()
    }

    fn put(&self, key: String, value: Vec<u8>) {
        if let Ok(mut blobs) = self.blobs.write() {
            blobs.insert(key, value.into());
        }
    }
}
