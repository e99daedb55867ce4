//! Module for the cache subsystem service object.
//!
//! A [`VmSystem`] is created once at boot, before the first cache, and every
//! cache keeps a reference to it. It owns the state that is shared between
//! all caches: the page index, the page allocator and the wait/notify
//! primitive, plus the quota of live caches.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use config::mm::MAX_VM_CACHES;
use systype::{SysError, SysResult};

use crate::{
    cache::LockedCache,
    frame::PageAllocator,
    notify::WaitNotify,
    page::Page,
    page_index::PageIndex,
};

/// The cache subsystem.
///
/// See the module-level documentation for more information.
pub struct VmSystem {
    index: PageIndex,
    allocator: Arc<dyn PageAllocator>,
    notifier: Arc<dyn WaitNotify>,
    live_caches: AtomicUsize,
    cache_limit: usize,
    shut_down: AtomicBool,
}

impl VmSystem {
    /// Initializes the subsystem with the default cache quota.
    pub fn new(allocator: Arc<dyn PageAllocator>, notifier: Arc<dyn WaitNotify>) -> Arc<Self> {
        Self::with_cache_limit(allocator, notifier, MAX_VM_CACHES)
    }

    /// Initializes the subsystem allowing at most `cache_limit` live caches.
    pub fn with_cache_limit(
        allocator: Arc<dyn PageAllocator>,
        notifier: Arc<dyn WaitNotify>,
        cache_limit: usize,
    ) -> Arc<Self> {
        log::info!("[VmSystem::new] page index ready, cache limit {}", cache_limit);
        Arc::new(Self {
            index: PageIndex::new(),
            allocator,
            notifier,
            live_caches: AtomicUsize::new(0),
            cache_limit,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn index(&self) -> &PageIndex {
        &self.index
    }

    pub fn allocator(&self) -> &dyn PageAllocator {
        self.allocator.as_ref()
    }

    pub fn notifier(&self) -> &dyn WaitNotify {
        self.notifier.as_ref()
    }

    /// Returns the number of caches that have been created and not deleted.
    pub fn live_caches(&self) -> usize {
        self.live_caches.load(Ordering::Acquire)
    }

    /// Shuts the subsystem down.
    ///
    /// No cache can be created afterwards.
    ///
    /// # Errors
    /// Returns [`SysError::EBUSY`] if caches or indexed pages are still alive,
    /// in which case the subsystem stays usable.
    pub fn teardown(&self) -> SysResult<()> {
        let caches = self.live_caches();
        let pages = self.index.len();
        if caches != 0 || pages != 0 {
            log::warn!("[VmSystem::teardown] {} caches and {} pages still alive", caches, pages);
            return Err(SysError::EBUSY);
        }
        self.shut_down.store(true, Ordering::Release);
        log::info!("[VmSystem::teardown] done");
        Ok(())
    }

    /// Counts a new cache against the quota.
    pub(crate) fn reserve_cache(&self) -> SysResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SysError::EPERM);
        }
        self.live_caches
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.cache_limit).then_some(live + 1)
            })
            .map(|_| ())
            .map_err(|_| SysError::ENOMEM)
    }

    pub(crate) fn unreserve_cache(&self) {
        if self.live_caches.fetch_sub(1, Ordering::AcqRel) == 0 {
            fatal!("[VmSystem] more caches deleted than created");
        }
    }

    /// Locks the cache `page` belongs to and runs `f` on it.
    ///
    /// The page's back-reference is not an owning one, so the cache is
    /// upgraded with [`Cache::acquire_unreferenced_ref`](crate::Cache::acquire_unreferenced_ref)
    /// first. Once the cache is locked, the page is checked to still belong
    /// to it, since the page may have moved to another cache (by a collapse)
    /// in the meantime; if so the whole procedure is retried.
    ///
    /// With `dont_wait`, gives up instead of waiting for a cache that is
    /// locked, being deleted or being collapsed. Otherwise a cache being
    /// deleted is waited out on the page's channel, which deletion notifies
    /// once the page is detached.
    ///
    /// Returns `None` if the page belongs to no cache.
    pub fn with_locked_page_cache<R>(
        &self,
        page: &Page,
        dont_wait: bool,
        f: impl FnOnce(&mut LockedCache<'_>) -> R,
    ) -> Option<R> {
        let mut f = Some(f);
        loop {
            let cache = page.cache()?;
            if !cache.acquire_unreferenced_ref() {
                // Being deleted: the page is about to be detached.
                if dont_wait {
                    return None;
                }
                // Deletion notifies the page after detaching it.
                let ticket = self.notifier.prepare_wait(page.wait_target());
                if page.cache_id() == Some(cache.id()) {
                    self.notifier.wait(ticket);
                } else {
                    self.notifier.cancel_wait(ticket);
                }
                continue;
            }

            let result = {
                let locked = if dont_wait {
                    cache.try_lock().filter(|locked| !locked.cache().is_collapsing())
                } else {
                    Some(cache.lock_when_idle())
                };
                match locked {
                    Some(mut locked) if page.cache_id() == Some(cache.id()) => {
                        f.take().map(|f| f(&mut locked))
                    }
                    _ => None,
                }
            };
            cache.release_ref();

            match result {
                Some(result) => return Some(result),
                None if dont_wait => return None,
                None => log::trace!("[VmSystem] page {:#x} moved while locking its cache, retry", page.pfn()),
            }
        }
    }
}
