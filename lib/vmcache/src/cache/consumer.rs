//! Consumer/source linkage and collapsing.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::Ordering;

use super::{Cache, LockedCache, collapse::CollapseGuard};

impl Cache {
    /// Makes the locked `consumer` a consumer of this cache.
    ///
    /// The consumer takes a reference of this cache and pins its store.
    /// Linking a cache that already has a source, or that this cache is
    /// derived from, is fatal.
    pub fn add_consumer(self: &Arc<Self>, consumer: &mut LockedCache<'_>) {
        if let Some(source) = consumer.source() {
            fatal!(
                "[Cache::add_consumer] {:?} already consumes {:?}",
                consumer.id(),
                source.id()
            );
        }

        // The consumer is not locked along the way: reaching it would be a cycle.
        let mut ancestor = Some(self.clone());
        while let Some(cache) = ancestor {
            if cache.id() == consumer.id() {
                fatal!("[Cache::add_consumer] {:?} is derived from {:?}", self.id(), consumer.id());
            }
            ancestor = cache.lock().source().cloned();
        }

        let mut source = self.lock_when_idle();
        if source
            .inner
            .consumers
            .insert(consumer.id(), Arc::downgrade(consumer.cache()))
            .is_some()
        {
            fatal!("[Cache::add_consumer] {:?} listed twice in {:?}", consumer.id(), self.id());
        }
        consumer.inner.source = Some(self.clone());
        self.acquire_ref();
        self.store.acquire_ref();
        log::debug!("[Cache::add_consumer] {:?} <- {:?}", self.id(), consumer.id());
    }

    /// Unlinks the locked `consumer` from this cache and drops the reference
    /// it held.
    ///
    /// If this leaves the cache unmapped with a single consumer and a source
    /// of its own, the cache is collapsed into that consumer.
    pub fn remove_consumer(self: &Arc<Self>, consumer: &mut LockedCache<'_>) {
        match consumer.source() {
            Some(source) if Arc::ptr_eq(source, self) => {}
            other => fatal!(
                "[Cache::remove_consumer] {:?} consumes {:?}, not {:?}",
                consumer.id(),
                other.map(|source| source.id()),
                self.id()
            ),
        }
        self.store.release_ref();

        let (candidate, gate) = {
            let mut source = self.lock();
            if source.inner.consumers.remove(&consumer.id()).is_none() {
                fatal!("[Cache::remove_consumer] {:?} not listed in {:?}", consumer.id(), self.id());
            }
            consumer.inner.source = None;
            log::debug!("[Cache::remove_consumer] {:?} <- {:?}", self.id(), consumer.id());

            let candidate = source.collapse_candidate();
            let gate = candidate
                .as_ref()
                .and_then(|_| self.collapse.try_enter(self.sys.notifier(), self.wait_target()));
            (candidate, gate)
        };

        if let Some(sole) = candidate {
            match gate {
                Some(gate) => self.collapse_into(&sole, gate),
                None => log::debug!("[Cache::remove_consumer] {:?} is already collapsing", self.id()),
            }
            sole.release_ref();
        }
        self.release_ref();
    }

    /// Collapses this cache into `sole`.
    ///
    /// Entered with the gate closed and no lock held. Takes `sole`'s lock and
    /// then this cache's, and merges only if nothing changed while unlocked.
    fn collapse_into(self: &Arc<Self>, sole: &Arc<Cache>, gate: CollapseGuard<'_>) {
        let mut consumer = sole.lock();
        let mut source = self.lock();
        if source.collapsible_into(&consumer) {
            source.merge_into(&mut consumer);
        } else {
            log::debug!("[Cache::collapse] {:?} changed while unlocked, abort", self.id());
        }
        drop(consumer);
        drop(gate);
        drop(source);
    }
}

impl LockedCache<'_> {
    /// Returns the sole consumer of the cache, with a reference taken, if
    /// the cache can be collapsed into it.
    fn collapse_candidate(&self) -> Option<Arc<Cache>> {
        if !self.inner.areas.is_empty() || self.inner.source.is_none() || self.inner.consumers.len() != 1 {
            return None;
        }
        let sole = self.inner.consumers.values().next()?.upgrade()?;
        if !sole.acquire_unreferenced_ref() {
            log::debug!("[Cache::remove_consumer] sole consumer {:?} is being deleted", sole.id());
            return None;
        }
        Some(sole)
    }

    /// Re-checks collapse eligibility once both caches are locked again.
    fn collapsible_into(&self, consumer: &LockedCache<'_>) -> bool {
        self.inner.areas.is_empty()
            && self.inner.source.is_some()
            && self.inner.consumers.len() == 1
            && self.inner.consumers.contains_key(&consumer.id())
            && consumer.source().is_some_and(|source| Arc::ptr_eq(source, self.cache))
    }

    /// Moves the pages of this cache into its sole consumer and hands the
    /// consumer over to this cache's source.
    ///
    /// A page the consumer already holds a copy of stays here and is freed
    /// with this cache. A consumer placeholder is replaced by the page it
    /// was about to read in. Any other collision with a busy page is fatal.
    fn merge_into(&mut self, consumer: &mut LockedCache<'_>) {
        let id = self.id();
        log::debug!("[Cache::collapse] merge {:?} into {:?}", id, consumer.id());
        self.inner.consumers.remove(&consumer.id());

        let pages: Vec<_> = self.inner.pages.iter().map(|(offset, page)| (*offset, page.clone())).collect();
        let mut shadowed = 0;
        for (offset, page) in pages {
            if let Some(existing) = consumer.inner.pages.get(&offset).cloned() {
                if !existing.is_busy() {
                    shadowed += 1;
                    continue;
                }
                if !existing.is_placeholder() {
                    fatal!(
                        "[Cache::collapse] {:?} offset {} collides with busy page {:?}",
                        consumer.id(),
                        offset,
                        existing
                    );
                }
                consumer.retire_placeholder(&existing);
            }
            let page = self.remove_page(&page);
            consumer.insert_page(page, offset);
        }

        let new_source = self.inner.source.take();
        if let Some(new_source) = &new_source {
            let mut upper = new_source.lock();
            if upper.inner.consumers.remove(&id).is_none() {
                fatal!("[Cache::collapse] {:?} not listed in its source {:?}", id, new_source.id());
            }
            upper
                .inner
                .consumers
                .insert(consumer.id(), Arc::downgrade(consumer.cache()));
        }
        log::debug!(
            "[Cache::collapse] {:?} now consumes {:?}, {} pages shadowed",
            consumer.id(),
            new_source.as_ref().map(|source| source.id()),
            shadowed
        );
        // The consumer inherits this cache's reference on the new source.
        consumer.inner.source = new_source;

        // The consumer's own reference on this cache goes with the edge. The
        // caller of `remove_consumer` still holds one, so it cannot be the last.
        self.cache.store.release_ref();
        if self.cache.ref_count.fetch_sub(1, Ordering::AcqRel) < 2 {
            fatal!("[Cache::collapse] {:?} lost its last reference while merged", id);
        }
    }
}
