//! Module for the cache entity.
//!
//! A [`Cache`] is shared through `Arc`, but the `Arc` only keeps its memory
//! alive. Ownership of the cache itself is tracked by an explicit reference
//! count held by its areas, its consumers and transient holders: when that
//! count drops to zero the cache is deleted, its pages are freed and its store
//! destroyed, even though stale `Arc`s may still point at it.
//!
//! Everything that must be done "with the cache lock held" is a method of
//! [`LockedCache`], the guard returned by [`Cache::lock`].

pub mod collapse;
mod consumer;
mod resize;
mod writeback;

use alloc::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Weak},
    vec::Vec,
};
use core::sync::atomic::{AtomicUsize, Ordering};

use config::mm::PAGE_USAGE_FRESH;
use mutex::{Spin, SpinLock, SpinMutexGuard};
use systype::SysResult;

use self::collapse::CollapseGate;
use crate::{
    notify::WaitTarget,
    page::{Page, PageFlags, PageState},
    store::CacheStore,
    system::VmSystem,
};

/// Identity of a cache: the address of its [`Cache`] object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheId(usize);

impl CacheId {
    pub const fn from_usize(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

/// Identity of an address-space area mapping a cache directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AreaId(pub usize);

/// Snapshot of a cache, see [`Cache::info`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheInfo {
    pub id: CacheId,
    pub ref_count: usize,
    pub page_count: usize,
    pub consumer_count: usize,
    pub area_count: usize,
    pub source: Option<CacheId>,
    pub virtual_base: usize,
    pub virtual_size: usize,
    pub collapsing: bool,
}

struct CacheInner {
    /// Resident pages by page-granular offset.
    pages: BTreeMap<usize, Arc<Page>>,
    areas: BTreeSet<AreaId>,
    /// Caches whose source is this cache.
    consumers: BTreeMap<CacheId, Weak<Cache>>,
    /// Owns one reference of the source cache.
    source: Option<Arc<Cache>>,
    virtual_base: usize,
    virtual_size: usize,
}

/// A virtual memory cache.
///
/// See the module-level documentation for more information.
pub struct Cache {
    sys: Arc<VmSystem>,
    store: Arc<dyn CacheStore>,
    ref_count: AtomicUsize,
    collapse: CollapseGate,
    inner: SpinLock<CacheInner>,
}

impl Cache {
    /// Creates a cache on top of `store`, holding one reference.
    ///
    /// # Errors
    /// Returns [`SysError::ENOMEM`](systype::SysError::ENOMEM) if the cache
    /// quota of `sys` is used up.
    pub fn create(sys: &Arc<VmSystem>, store: Arc<dyn CacheStore>) -> SysResult<Arc<Self>> {
        sys.reserve_cache()?;
        let cache = Arc::new(Self {
            sys: sys.clone(),
            store,
            ref_count: AtomicUsize::new(1),
            collapse: CollapseGate::new(),
            inner: SpinLock::new(CacheInner {
                pages: BTreeMap::new(),
                areas: BTreeSet::new(),
                consumers: BTreeMap::new(),
                source: None,
                virtual_base: 0,
                virtual_size: 0,
            }),
        });
        cache.store.attach(cache.id());
        log::debug!("[Cache::create] {:?}", cache.id());
        Ok(cache)
    }

    pub fn id(&self) -> CacheId {
        CacheId::from_usize(self as *const Self as usize)
    }

    pub fn system(&self) -> &Arc<VmSystem> {
        &self.sys
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Takes another reference. The caller must already own one.
    pub fn acquire_ref(&self) {
        if self.ref_count.fetch_add(1, Ordering::AcqRel) == 0 {
            fatal!("[Cache::acquire_ref] {:?} has no reference left", self.id());
        }
    }

    /// Drops a reference, deleting the cache if it was the last one.
    ///
    /// Must not be called with any cache lock of this cache's subtree held,
    /// since deletion locks the cache and its source.
    pub fn release_ref(self: &Arc<Self>) {
        match self.ref_count.fetch_sub(1, Ordering::AcqRel) {
            0 => fatal!("[Cache::release_ref] {:?} released more often than acquired", self.id()),
            1 => self.delete(),
            _ => {}
        }
    }

    /// Takes a reference without owning one yet.
    ///
    /// Used when the cache was reached through a non-owning path, like the
    /// back-reference of a page. Fails if the count already dropped to zero,
    /// i.e. the cache is being deleted.
    pub fn acquire_unreferenced_ref(&self) -> bool {
        let mut count = self.ref_count.load(Ordering::Acquire);
        loop {
            if count == 0 {
                return false;
            }
            match self
                .ref_count
                .compare_exchange_weak(count, count + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(current) => count = current,
            }
        }
    }

    pub fn lock(self: &Arc<Self>) -> LockedCache<'_> {
        LockedCache {
            cache: self,
            inner: self.inner.lock(),
        }
    }

    pub fn try_lock(self: &Arc<Self>) -> Option<LockedCache<'_>> {
        self.inner.try_lock().map(|inner| LockedCache { cache: self, inner })
    }

    /// Locks the cache once no collapse of it is in progress.
    pub fn lock_when_idle(self: &Arc<Self>) -> LockedCache<'_> {
        loop {
            let locked = self.lock();
            if !self.collapse.is_collapsing() {
                return locked;
            }
            let ticket = self.sys.notifier().prepare_wait(self.wait_target());
            drop(locked);
            log::trace!("[Cache::lock_when_idle] {:?} is collapsing, wait", self.id());
            self.sys.notifier().wait(ticket);
        }
    }

    pub fn is_collapsing(&self) -> bool {
        self.collapse.is_collapsing()
    }

    /// Channel contexts waiting for a collapse of this cache sleep on.
    pub fn wait_target(&self) -> WaitTarget {
        WaitTarget::Cache(self.id())
    }

    /// Registers an area mapping this cache, which takes a reference.
    ///
    /// The first area also pins the store.
    pub fn insert_area(self: &Arc<Self>, area: AreaId) {
        self.acquire_ref();
        let mut locked = self.lock();
        if !locked.inner.areas.insert(area) {
            fatal!("[Cache::insert_area] {:?} already registered in {:?}", area, self.id());
        }
        if locked.inner.areas.len() == 1 {
            self.store.acquire_ref();
        }
    }

    /// Unregisters an area and drops its reference.
    pub fn remove_area(self: &Arc<Self>, area: AreaId) {
        {
            let mut locked = self.lock();
            if !locked.inner.areas.remove(&area) {
                fatal!("[Cache::remove_area] {:?} not registered in {:?}", area, self.id());
            }
            if locked.inner.areas.is_empty() {
                self.store.release_ref();
            }
        }
        self.release_ref();
    }

    pub fn info(self: &Arc<Self>) -> CacheInfo {
        let locked = self.lock();
        CacheInfo {
            id: self.id(),
            ref_count: self.ref_count(),
            page_count: locked.page_count(),
            consumer_count: locked.consumer_count(),
            area_count: locked.area_count(),
            source: locked.source().map(|source| source.id()),
            virtual_base: locked.virtual_base(),
            virtual_size: locked.virtual_size(),
            collapsing: self.is_collapsing(),
        }
    }

    /// Logs the tree of caches consuming this one.
    pub fn dump(self: &Arc<Self>) {
        self.dump_level(0);
    }

    fn dump_level(self: &Arc<Self>, level: usize) {
        let info = self.info();
        log::info!("{:indent$}{:?}", "", info, indent = level * 2);
        let consumers = self.lock().consumers();
        for consumer in consumers {
            consumer.dump_level(level + 1);
        }
    }

    fn delete(self: &Arc<Self>) {
        log::debug!("[Cache::delete] {:?}", self.id());
        let mut locked = self.lock();
        if !locked.inner.areas.is_empty() || !locked.inner.consumers.is_empty() {
            fatal!(
                "[Cache::delete] {:?} still has {} areas and {} consumers",
                self.id(),
                locked.inner.areas.len(),
                locked.inner.consumers.len()
            );
        }

        let pages = core::mem::take(&mut locked.inner.pages);
        for page in pages.into_values() {
            if page.is_mapped() {
                fatal!("[Cache::delete] {:?}: page still mapped: {:?}", self.id(), page);
            }
            self.sys.index().remove(&page);
            page.detach(self.id());
            if page.is_placeholder() {
                page.set_state(PageState::Inactive);
            }
            // Wakes lookups that found the page while its cache was dying.
            self.sys.notifier().notify_all(page.wait_target());
            if !page.is_placeholder() {
                self.sys.allocator().free(self, page);
            }
        }

        self.store.destroy();

        if let Some(source) = locked.inner.source.clone() {
            source.remove_consumer(&mut locked);
        }
        drop(locked);
        self.sys.unreserve_cache();
    }
}

/// A locked [`Cache`].
pub struct LockedCache<'a> {
    cache: &'a Arc<Cache>,
    inner: SpinMutexGuard<'a, CacheInner, Spin>,
}

impl<'a> LockedCache<'a> {
    pub fn cache(&self) -> &'a Arc<Cache> {
        self.cache
    }

    pub fn id(&self) -> CacheId {
        self.cache.id()
    }

    /// Makes `page` resident at `offset`.
    ///
    /// The page must not belong to any cache, and `offset` must be free.
    pub fn insert_page(&mut self, page: Arc<Page>, offset: usize) {
        page.attach(self.cache, offset);
        page.set_usage_count(PAGE_USAGE_FRESH);
        if let Some(resident) = self.inner.pages.insert(offset, page.clone()) {
            fatal!(
                "[LockedCache::insert_page] {:?} offset {}: {:?} already resident, inserting {:?}",
                self.id(),
                offset,
                resident,
                page
            );
        }
        self.cache.sys.index().insert(&page);
    }

    /// Removes a resident page and returns it.
    pub fn remove_page(&mut self, page: &Page) -> Arc<Page> {
        self.assert_owned(page);
        self.cache.sys.index().remove(page);
        let offset = page.cache_offset();
        let removed = match self.inner.pages.remove(&offset) {
            Some(resident) if core::ptr::eq(Arc::as_ptr(&resident), page) => resident,
            other => fatal!(
                "[LockedCache::remove_page] {:?} offset {}: listed {:?}, removing {:?}",
                self.id(),
                offset,
                other,
                page
            ),
        };
        removed.detach(self.id());
        removed
    }

    /// Allocates a page and makes it resident at `offset`.
    ///
    /// # Errors
    /// Returns whatever the page allocator fails with.
    pub fn allocate_page(&mut self, offset: usize) -> SysResult<Arc<Page>> {
        let page = self.cache.sys.allocator().allocate(self.cache)?;
        page.set_state(PageState::Active);
        self.insert_page(page.clone(), offset);
        Ok(page)
    }

    /// Removes a resident page and gives it back to the page allocator.
    pub fn free_page(&mut self, page: &Page) {
        let page = self.remove_page(page);
        self.cache.sys.allocator().free(self.cache, page);
    }

    /// Looks the page at `offset` up in the page index.
    pub fn lookup_page(&self, offset: usize) -> Option<Arc<Page>> {
        self.cache.sys.index().lookup(self.id(), offset)
    }

    pub fn page_count(&self) -> usize {
        self.inner.pages.len()
    }

    /// Iterates over the resident pages in offset order.
    pub fn pages(&self) -> impl Iterator<Item = &Arc<Page>> {
        self.inner.pages.values()
    }

    pub fn source(&self) -> Option<&Arc<Cache>> {
        self.inner.source.as_ref()
    }

    /// Returns the consumers of the cache that are still alive.
    pub fn consumers(&self) -> Vec<Arc<Cache>> {
        self.inner.consumers.values().filter_map(Weak::upgrade).collect()
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.consumers.len()
    }

    pub fn area_count(&self) -> usize {
        self.inner.areas.len()
    }

    pub fn virtual_base(&self) -> usize {
        self.inner.virtual_base
    }

    pub fn set_virtual_base(&mut self, base: usize) {
        self.inner.virtual_base = base;
    }

    pub fn virtual_size(&self) -> usize {
        self.inner.virtual_size
    }

    /// Marks a resident page busy, e.g. before reading it in.
    pub fn mark_page_busy(&mut self, page: &Page) {
        self.assert_owned(page);
        if page.is_busy() {
            fatal!("[LockedCache::mark_page_busy] page already busy: {:?}", page);
        }
        page.set_state(PageState::Busy);
    }

    /// Ends the busy period of a page, moving it to `state`, and wakes its
    /// waiters.
    pub fn mark_page_unbusy(&mut self, page: &Page, state: PageState) {
        self.assert_owned(page);
        if !page.is_busy() || state == PageState::Busy {
            fatal!("[LockedCache::mark_page_unbusy] bad transition to {:?}: {:?}", state, page);
        }
        page.clear_flags(PageFlags::BUSY_WRITING);
        page.set_state(state);
        self.cache.sys.notifier().notify_all(page.wait_target());
    }

    /// Removes a placeholder page and wakes the faults waiting on it.
    fn retire_placeholder(&mut self, page: &Page) {
        let page = self.remove_page(page);
        page.set_state(PageState::Inactive);
        self.cache.sys.notifier().notify_all(page.wait_target());
    }

    fn assert_owned(&self, page: &Page) {
        let owner = page.cache_id();
        if owner != Some(self.id()) {
            fatal!("{:?}: page owned by {:?}: {:?}", self.id(), owner, page);
        }
    }
}
