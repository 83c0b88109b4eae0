use std::num::NonZeroUsize;

use anyhow::Result;
use lru::LruCache;
use parking_lot::Mutex;

use super::{HeadCache, IndexCache, NamespaceCache};
use crate::{
    crdt::{Index, Link, Namespace},
    peer::Address,
};

/// Bounded in-memory caches with LRU eviction.
#[derive(Debug)]
pub struct MemoryCache {
    head: Mutex<Option<Link>>,
    indices: Mutex<LruCache<Address, Index>>,
    namespaces: Mutex<LruCache<Address, Namespace>>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl MemoryCache {
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Create a cache holding up to `capacity` indices and `capacity`
    /// namespaces. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            head: Mutex::new(None),
            indices: Mutex::new(LruCache::new(cap)),
            namespaces: Mutex::new(LruCache::new(cap)),
        }
    }
}

impl HeadCache for MemoryCache {
    fn head(&self) -> Result<Option<Link>> {
        Ok(self.head.lock().clone())
    }

    fn set_head(&self, link: &Link) -> Result<()> {
        *self.head.lock() = Some(link.clone());
        Ok(())
    }
}

impl IndexCache for MemoryCache {
    fn get_index(&self, path: &Address) -> Result<Option<Index>> {
        Ok(self.indices.lock().get(path).cloned())
    }

    fn set_index(&self, path: &Address, index: &Index) -> Result<()> {
        let mut indices = self.indices.lock();
        // promote instead of overwriting
        if indices.get(path).is_none() {
            indices.put(path.clone(), index.clone());
        }
        Ok(())
    }
}

impl NamespaceCache for MemoryCache {
    fn get_namespace(&self, path: &Address) -> Result<Option<Namespace>> {
        Ok(self.namespaces.lock().get(path).cloned())
    }

    fn set_namespace(&self, path: &Address, namespace: &Namespace) -> Result<()> {
        let mut namespaces = self.namespaces.lock();
        if namespaces.get(path).is_none() {
            namespaces.put(path.clone(), namespace.clone());
        }
        Ok(())
    }
}
