//! Resizing of caches.

use alloc::{sync::Arc, vec::Vec};

use config::mm::PAGE_SIZE;
use systype::SysResult;

use super::{Cache, LockedCache};
use crate::page::{Page, PageFlags};

impl Cache {
    /// Sets the size of the cache to `new_size` bytes.
    ///
    /// Shrinking frees every resident page at or beyond the new end. Pages
    /// being written back are left to their writer, see
    /// [`LockedCache::end_writeback`]. Other busy pages are waited for.
    ///
    /// # Errors
    /// Returns the error of the store commit unchanged, in which case the
    /// cache is not modified.
    pub fn resize(self: &Arc<Self>, new_size: usize) -> SysResult<()> {
        let mut locked = self.lock();
        let old_size = locked.virtual_size();
        if let Err(err) = self.store.commit(new_size) {
            log::warn!("[Cache::resize] {:?} commit of {:#x} bytes failed: {}", self.id(), new_size, err);
            return Err(err);
        }
        if new_size < old_size {
            locked = self.shrink(locked, new_size);
        }
        locked.inner.virtual_size = new_size;
        log::debug!("[Cache::resize] {:?} {:#x} -> {:#x}", self.id(), old_size, new_size);
        Ok(())
    }

    fn shrink<'a>(self: &'a Arc<Self>, mut locked: LockedCache<'a>, new_size: usize) -> LockedCache<'a> {
        let notifier = self.sys.notifier();
        let first = new_size.div_ceil(PAGE_SIZE);
        // Pages handed over to their writer, which stay busy until it is done.
        // Holding them keeps a freed descriptor from being mistaken for a new one.
        let mut handed_over: Vec<Arc<Page>> = Vec::new();

        'scan: loop {
            let doomed: Vec<Arc<Page>> = locked.inner.pages.range(first..).map(|(_, page)| page.clone()).collect();
            for page in doomed {
                if handed_over.iter().any(|handed| Arc::ptr_eq(handed, &page)) {
                    continue;
                }
                if page.is_busy_writing() {
                    page.clear_flags(PageFlags::BUSY_WRITING);
                    log::debug!("[Cache::resize] offset {} is being written, writer frees it", page.cache_offset());
                    handed_over.push(page);
                    continue;
                }
                if page.is_busy() {
                    let ticket = notifier.prepare_wait(page.wait_target());
                    drop(locked);
                    notifier.wait(ticket);
                    locked = self.lock();
                    continue 'scan;
                }
                locked.free_page(&page);
            }
            return locked;
        }
    }
}
