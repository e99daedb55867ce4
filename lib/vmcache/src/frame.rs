//! Module for the page allocator collaborator.
//!
//! Caches never create or destroy page frames themselves: they ask a
//! [`PageAllocator`] for a page and hand it back when they are done with it.
//! [`FramePool`] is a simple allocator over a contiguous range of frame
//! numbers, good enough for the kernel's early boot and for tests.

use alloc::{sync::Arc, vec::Vec};

use config::mm::{FRAME_POOL_PAGES, FRAME_POOL_START};
use mutex::SpinNoIrqLock;
use systype::{SysError, SysResult};

use crate::{
    cache::Cache,
    page::{Page, PageState},
};

/// Supplies and reclaims the pages of caches.
pub trait PageAllocator: Send + Sync {
    /// Allocates a page on behalf of `cache`.
    ///
    /// The page is returned detached, in state [`PageState::Unused`]; the
    /// caller inserts it with [`LockedCache::insert_page`](crate::LockedCache::insert_page).
    ///
    /// # Errors
    /// Returns [`SysError::ENOMEM`] when no frame is left.
    fn allocate(&self, cache: &Cache) -> SysResult<Arc<Page>>;

    /// Takes back a page that `cache` has removed from its page list.
    fn free(&self, cache: &Cache, page: Arc<Page>);
}

/// Free frame numbers of a [`FramePool`].
///
/// Frames are handed out from a bump pointer until the range is used up;
/// frames given back are recycled first.
struct FrameList {
    next: usize,
    end: usize,
    recycled: Vec<usize>,
}

impl FrameList {
    fn new(start: usize, count: usize) -> Self {
        debug_assert!(count > 0);
        Self {
            next: start,
            end: start + count,
            recycled: Vec::new(),
        }
    }

    fn alloc(&mut self) -> Option<usize> {
        self.recycled.pop().or_else(|| {
            let pfn = self.next;
            (pfn < self.end).then(|| {
                self.next += 1;
                pfn
            })
        })
    }

    fn dealloc(&mut self, pfn: usize) {
        self.recycled.push(pfn);
    }

    fn available(&self) -> usize {
        self.end - self.next + self.recycled.len()
    }
}

/// [`PageAllocator`] over the frames `start..start + count`.
pub struct FramePool {
    frames: SpinNoIrqLock<FrameList>,
}

impl FramePool {
    pub fn new(start: usize, count: usize) -> Self {
        Self {
            frames: SpinNoIrqLock::new(FrameList::new(start, count)),
        }
    }

    /// Returns the number of frames that can still be allocated.
    pub fn free_frames(&self) -> usize {
        self.frames.lock().available()
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new(FRAME_POOL_START, FRAME_POOL_PAGES)
    }
}

impl PageAllocator for FramePool {
    fn allocate(&self, cache: &Cache) -> SysResult<Arc<Page>> {
        let Some(pfn) = self.frames.lock().alloc() else {
            log::warn!("[FramePool::allocate] out of frames for cache {:?}", cache.id());
            return Err(SysError::ENOMEM);
        };
        let page = Page::new(pfn);
        page.set_state(PageState::Unused);
        Ok(Arc::new(page))
    }

    fn free(&self, cache: &Cache, page: Arc<Page>) {
        if page.is_placeholder() {
            fatal!("[FramePool::free] cache {:?} freed placeholder {:?}", cache.id(), page);
        }
        if page.cache_id().is_some() || page.is_mapped() {
            fatal!("[FramePool::free] cache {:?} freed a page still in use: {:?}", cache.id(), page);
        }
        page.set_state(PageState::Free);
        log::trace!("[FramePool::free] frame {:#x} back from cache {:?}", page.pfn(), cache.id());
        self.frames.lock().dealloc(page.pfn());
    }
}
