//! Module for the system-wide page index.
//!
//! The index maps `(cache, page offset)` to the resident [`Page`], so that the
//! existence of a page in any cache can be checked in O(1) without taking the
//! cache lock. It is protected by a [`SpinNoIrqLock`] that is held for a single
//! table operation only, which makes it usable from interrupt context.

use alloc::sync::Arc;
use core::hash::{BuildHasherDefault, Hash, Hasher};

use config::mm::{CACHE_ADDR_SHIFT, CACHE_HASH_MULTIPLIER, CACHE_HASH_PRIME, PAGE_INDEX_INITIAL_CAPACITY};
use hashbrown::{HashMap, hash_map::Entry};
use mutex::SpinNoIrqLock;

use crate::{cache::CacheId, page::Page};

/// Key of the page index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageKey {
    pub cache: CacheId,
    /// Page-granular offset in the cache.
    pub offset: usize,
}

impl PageKey {
    pub fn new(cache: CacheId, offset: usize) -> Self {
        Self { cache, offset }
    }

    /// Hash of the key.
    ///
    /// Cache objects are large and allocator-aligned, so the low bits of their
    /// address are dropped and the rest is multiplied by a prime before adding
    /// the offset. The sum is then spread over all 64 bits, because the table
    /// takes its control bytes from the top of the hash.
    pub fn hash_value(&self) -> u64 {
        let cache = (self.cache.as_usize() >> CACHE_ADDR_SHIFT) as u64;
        (self.offset as u64)
            .wrapping_add(cache.wrapping_mul(CACHE_HASH_PRIME))
            .wrapping_mul(CACHE_HASH_MULTIPLIER)
    }
}

impl Hash for PageKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash_value());
    }
}

/// Hasher passing [`PageKey::hash_value`] through unchanged.
#[derive(Default)]
pub struct PageKeyHasher(u64);

impl Hasher for PageKeyHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 = (self.0.rotate_left(8) ^ *byte as u64).wrapping_mul(CACHE_HASH_MULTIPLIER);
        }
    }

    fn write_u64(&mut self, value: u64) {
        self.0 = value;
    }
}

type PageTable = HashMap<PageKey, Arc<Page>, BuildHasherDefault<PageKeyHasher>>;

/// The page index.
///
/// See the module-level documentation for more information.
pub struct PageIndex {
    table: SpinNoIrqLock<PageTable>,
}

impl PageIndex {
    pub fn new() -> Self {
        Self::with_capacity(PAGE_INDEX_INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            table: SpinNoIrqLock::new(PageTable::with_capacity_and_hasher(capacity, Default::default())),
        }
    }

    /// Returns the page resident at `offset` in `cache`.
    pub fn lookup(&self, cache: CacheId, offset: usize) -> Option<Arc<Page>> {
        self.table.lock().get(&PageKey::new(cache, offset)).cloned()
    }

    /// Adds a page, which must already be attached to its cache.
    ///
    /// Indexing a second page under the same key is fatal.
    pub fn insert(&self, page: &Arc<Page>) {
        let key = Self::key_of(page);
        let existing = match self.table.lock().entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(page.clone());
                None
            }
            Entry::Occupied(slot) => Some(slot.get().pfn()),
        };
        if let Some(existing) = existing {
            fatal!(
                "page index: {:?} offset {} already holds page {:#x}, inserting {:#x}",
                key.cache,
                key.offset,
                existing,
                page.pfn()
            );
        }
    }

    /// Removes a page, which must still be attached to its cache.
    pub fn remove(&self, page: &Page) {
        let key = Self::key_of(page);
        let removed = {
            let mut table = self.table.lock();
            let indexed = table
                .get(&key)
                .is_some_and(|indexed| core::ptr::eq(Arc::as_ptr(indexed), page));
            if indexed { table.remove(&key) } else { None }
        };
        if removed.is_none() {
            fatal!(
                "page index: page {:#x} is not indexed under {:?} offset {}",
                page.pfn(),
                key.cache,
                key.offset
            );
        }
    }

    /// Returns the number of indexed pages.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key_of(page: &Page) -> PageKey {
        match page.cache_id() {
            Some(cache) => PageKey::new(cache, page.cache_offset()),
            None => fatal!("page index: page {:#x} has no cache", page.pfn()),
        }
    }
}

impl Default for PageIndex {
    fn default() -> Self {
        Self::new()
    }
}
