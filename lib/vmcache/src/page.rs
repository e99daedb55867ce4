//! Module for resident page descriptors.
//!
//! A [`Page`] describes one physical page while it is resident in a cache. The
//! page belongs to at most one [`Cache`] at a time; the back-reference to that
//! cache is weak and only used for identity checks and for finding the cache
//! of a page found through the [`PageIndex`](crate::PageIndex).
//!
//! The descriptor is shared (`Arc<Page>`) between the owning cache, the page
//! index and whoever is currently working on the page, so all mutable fields
//! are atomics or sit behind an interrupt-masking lock.

use alloc::sync::{Arc, Weak};
use core::{
    fmt::{self, Debug},
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

use bitflags::bitflags;
use common::atomic_bitflags;
use config::mm::PAGE_USAGE_FRESH;
use mutex::SpinNoIrqLock;
use strum::FromRepr;

use crate::{
    cache::{Cache, CacheId},
    notify::WaitTarget,
};

/// Frame number given to placeholder pages, which have no physical frame.
pub const PLACEHOLDER_PFN: usize = usize::MAX;

/// State of a page.
#[derive(FromRepr, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// Resident and recently used.
    Active = 0,
    /// Resident, not recently used.
    Inactive = 1,
    /// Undergoing I/O or fault resolution. Must not be freed or moved.
    Busy = 2,
    /// Resident and dirty.
    Modified = 3,
    /// In the free list.
    Free = 4,
    /// In the free list, zeroed.
    Clear = 5,
    /// Pinned by the kernel.
    Wired = 6,
    /// Allocated but not handed to anyone yet.
    Unused = 7,
}

bitflags! {
    /// Flags qualifying the state of a page.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// A busy page that is being written back.
        ///
        /// Clearing the flag while the write is in flight hands the job of
        /// freeing the page over to the writer.
        const BUSY_WRITING = 1 << 0;
        /// The page has no frame and only marks an in-flight read fault.
        const PLACEHOLDER = 1 << 1;
    }
}

atomic_bitflags!(PageFlags, AtomicU8);

/// Owning cache of a page.
struct PageOwner {
    id: CacheId,
    cache: Weak<Cache>,
}

/// A resident page.
///
/// See the module-level documentation for more information.
pub struct Page {
    /// Physical frame number.
    pfn: usize,
    state: AtomicU8,
    flags: AtomicPageFlags,
    /// Replacement hint maintained by the page scanner.
    usage_count: AtomicU8,
    /// Number of page table entries mapping this page.
    mapped_count: AtomicUsize,
    /// Number of kernel pins on this page.
    wired_count: AtomicUsize,
    /// Page-granular offset in the owning cache.
    cache_offset: AtomicUsize,
    owner: SpinNoIrqLock<Option<PageOwner>>,
}

impl Page {
    /// Creates a free page descriptor for frame `pfn`.
    pub fn new(pfn: usize) -> Self {
        Self::with_state(pfn, PageState::Free, PageFlags::empty())
    }

    /// Creates a placeholder page.
    ///
    /// A placeholder is inserted by the fault handler while it reads a page in,
    /// so that concurrent faults on the same offset wait instead of reading the
    /// page twice. It is busy for its whole life and owns no frame.
    pub fn new_placeholder() -> Self {
        Self::with_state(PLACEHOLDER_PFN, PageState::Busy, PageFlags::PLACEHOLDER)
    }

    fn with_state(pfn: usize, state: PageState, flags: PageFlags) -> Self {
        Self {
            pfn,
            state: AtomicU8::new(state as u8),
            flags: AtomicPageFlags::new(flags),
            usage_count: AtomicU8::new(PAGE_USAGE_FRESH),
            mapped_count: AtomicUsize::new(0),
            wired_count: AtomicUsize::new(0),
            cache_offset: AtomicUsize::new(0),
            owner: SpinNoIrqLock::new(None),
        }
    }

    /// Returns the physical frame number of the page.
    pub fn pfn(&self) -> usize {
        self.pfn
    }

    pub fn state(&self) -> PageState {
        let raw = self.state.load(Ordering::Acquire);
        PageState::from_repr(raw).unwrap_or_else(|| fatal!("page {:#x}: bad state {}", self.pfn, raw))
    }

    pub fn set_state(&self, state: PageState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn flags(&self) -> PageFlags {
        self.flags.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.state() == PageState::Busy
    }

    /// Returns whether the page is busy because it is being written back.
    pub fn is_busy_writing(&self) -> bool {
        self.is_busy() && self.flags().contains(PageFlags::BUSY_WRITING)
    }

    pub fn is_placeholder(&self) -> bool {
        self.flags().contains(PageFlags::PLACEHOLDER)
    }

    pub(crate) fn set_flags(&self, flags: PageFlags) -> PageFlags {
        self.flags.fetch_or(flags, Ordering::AcqRel)
    }

    pub(crate) fn clear_flags(&self, flags: PageFlags) -> PageFlags {
        self.flags.fetch_remove(flags, Ordering::AcqRel)
    }

    pub fn usage_count(&self) -> u8 {
        self.usage_count.load(Ordering::Relaxed)
    }

    pub fn set_usage_count(&self, usage: u8) {
        self.usage_count.store(usage, Ordering::Relaxed);
    }

    /// Records a new page table entry pointing at this page.
    pub fn map(&self) {
        self.mapped_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unmap(&self) {
        let prev = self.mapped_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            fatal!("page {:#x}: unmapped more often than mapped", self.pfn);
        }
    }

    pub fn wire(&self) {
        self.wired_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unwire(&self) {
        let prev = self.wired_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            fatal!("page {:#x}: unwired more often than wired", self.pfn);
        }
    }

    /// Returns whether the page is mapped or wired, i.e. must not be freed.
    pub fn is_mapped(&self) -> bool {
        self.mapped_count.load(Ordering::Acquire) != 0 || self.wired_count.load(Ordering::Acquire) != 0
    }

    /// Returns the page-granular offset of the page in its cache.
    pub fn cache_offset(&self) -> usize {
        self.cache_offset.load(Ordering::Acquire)
    }

    /// Returns the identity of the owning cache, if any.
    pub fn cache_id(&self) -> Option<CacheId> {
        self.owner.lock().as_ref().map(|owner| owner.id)
    }

    /// Returns the owning cache, if any.
    ///
    /// The result does not own a reference of the cache: use
    /// [`Cache::acquire_unreferenced_ref`] before relying on it staying alive.
    pub fn cache(&self) -> Option<Arc<Cache>> {
        self.owner.lock().as_ref().and_then(|owner| owner.cache.upgrade())
    }

    /// Channel waiters of this page sleep on.
    pub fn wait_target(&self) -> WaitTarget {
        WaitTarget::Page(self as *const Page as usize)
    }

    /// Makes `cache` the owner of the page at `offset`.
    pub(crate) fn attach(&self, cache: &Arc<Cache>, offset: usize) {
        let mut owner = self.owner.lock();
        if let Some(current) = owner.as_ref() {
            let current = current.id;
            drop(owner);
            fatal!(
                "page {:#x}: inserted into cache {:?} but still owned by {:?}",
                self.pfn,
                cache.id(),
                current
            );
        }
        self.cache_offset.store(offset, Ordering::Release);
        *owner = Some(PageOwner {
            id: cache.id(),
            cache: Arc::downgrade(cache),
        });
    }

    /// Clears the owner of the page, which must be `cache`.
    pub(crate) fn detach(&self, cache: CacheId) {
        let mut owner = self.owner.lock();
        match owner.as_ref().map(|owner| owner.id) {
            Some(id) if id == cache => *owner = None,
            other => {
                drop(owner);
                fatal!("page {:#x}: detached from {:?} but owned by {:?}", self.pfn, cache, other);
            }
        }
    }
}

impl Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("pfn", &format_args!("{:#x}", self.pfn))
            .field("state", &self.state())
            .field("flags", &self.flags())
            .field("cache", &self.cache_id())
            .field("cache_offset", &self.cache_offset())
            .finish()
    }
}
