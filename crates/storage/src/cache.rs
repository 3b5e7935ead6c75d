//! Shared byte-range cache
//!
//! Keyed by (block, tenant, object, offset, length): a cached range is only
//! returned for exactly the same read. Entries are evicted in insertion
//! order once the byte budget is exceeded.

use dashmap::DashMap;
use parking_lot::Mutex;
use spanstore_core::BlockId;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identity of one cached range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Block
    pub block: BlockId,
    /// Tenant
    pub tenant: String,
    /// Object name
    pub object: String,
    /// Range offset
    pub offset: u64,
    /// Range length
    pub len: u64,
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that missed
    pub misses: u64,
    /// Bytes currently held
    pub bytes: u64,
    /// Entries currently held
    pub entries: usize,
}

/// Byte-budgeted range cache shared by all block readers.
#[derive(Debug)]
pub struct RangeCache {
    entries: DashMap<CacheKey, Arc<[u8]>>,
    order: Mutex<VecDeque<CacheKey>>,
    max_bytes: u64,
    bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RangeCache {
    /// Cache holding at most `max_bytes` of range data.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            max_bytes,
            bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached bytes for `key`, counting the hit or miss.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<[u8]>> {
        match self.entries.get(key) {
            Some(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(v.value()))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store `data` under `key`. Ranges larger than the whole budget are
    /// not cached.
    pub fn put(&self, key: CacheKey, data: Arc<[u8]>) {
        let len = data.len() as u64;
        if len > self.max_bytes {
            return;
        }

        let mut order = self.order.lock();
        if self.entries.insert(key.clone(), data).is_some() {
            return;
        }
        order.push_back(key);
        let mut total = self.bytes.fetch_add(len, Ordering::Relaxed) + len;
        while total > self.max_bytes {
            let Some(oldest) = order.pop_front() else { break };
            if let Some((_, evicted)) = self.entries.remove(&oldest) {
                let n = evicted.len() as u64;
                total = self.bytes.fetch_sub(n, Ordering::Relaxed) - n;
            }
        }
    }

    /// Drop every range of one block.
    pub fn invalidate_block(&self, block: BlockId) {
        let mut order = self.order.lock();
        order.retain(|k| k.block != block);
        self.entries.retain(|k, v| {
            if k.block == block {
                self.bytes.fetch_sub(v.len() as u64, Ordering::Relaxed);
                false
            } else {
                true
            }
        });
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}
