//! Busy-page protocol of page writeback.
//!
//! A page being written back is busy with [`PageFlags::BUSY_WRITING`] set.
//! Whoever wants to get rid of the page meanwhile (a shrinking resize) does
//! not wait for the writer: it clears the flag instead, and the writer frees
//! the page when the write completes.

use systype::{SysError, SysResult};

use super::LockedCache;
use crate::page::{Page, PageFlags, PageState};

impl LockedCache<'_> {
    /// Marks a resident page busy for writeback.
    ///
    /// # Errors
    /// Returns [`SysError::EBUSY`] if the page is busy already.
    pub fn begin_writeback(&mut self, page: &Page) -> SysResult<()> {
        self.assert_owned(page);
        if page.is_busy() {
            return Err(SysError::EBUSY);
        }
        page.set_state(PageState::Busy);
        page.set_flags(PageFlags::BUSY_WRITING);
        Ok(())
    }

    /// Ends the writeback of a page.
    ///
    /// Returns `true` if the page stays resident. Returns `false` if the page
    /// was given up while being written, in which case it is freed here.
    pub fn end_writeback(&mut self, page: &Page) -> bool {
        self.assert_owned(page);
        if !page.is_busy() {
            fatal!("[LockedCache::end_writeback] page is not busy: {:?}", page);
        }
        let cache = self.cache;
        let notifier = cache.sys.notifier();
        if page.clear_flags(PageFlags::BUSY_WRITING).contains(PageFlags::BUSY_WRITING) {
            page.set_state(PageState::Inactive);
            notifier.notify_all(page.wait_target());
            return true;
        }

        log::debug!(
            "[LockedCache::end_writeback] {:?} offset {} dropped during write",
            cache.id(),
            page.cache_offset()
        );
        let page = self.remove_page(page);
        notifier.notify_all(page.wait_target());
        cache.sys.allocator().free(cache, page);
        false
    }
}
