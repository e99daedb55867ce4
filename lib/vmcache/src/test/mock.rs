//! Test doubles and helpers.

use std::sync::{
    Arc,
    atomic::{AtomicIsize, AtomicUsize, Ordering},
};

use mutex::SpinLock;
use systype::{SysError, SysResult};

use crate::{Cache, CacheId, CacheStore, FramePool, Page, SpinNotifier, VmSystem};

/// Frames available to each test system.
pub const TEST_FRAMES: usize = 64;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Store recording what the cache did to it.
#[derive(Default)]
pub struct RecordingStore {
    attached: SpinLock<Option<CacheId>>,
    commits: SpinLock<Vec<usize>>,
    fail_commit: SpinLock<Option<SysError>>,
    refs: AtomicIsize,
    destroyed: AtomicUsize,
}

impl RecordingStore {
    pub fn attached(&self) -> Option<CacheId> {
        *self.attached.lock()
    }

    pub fn commits(&self) -> Vec<usize> {
        self.commits.lock().clone()
    }

    /// Makes the next commit fail with `err`.
    pub fn fail_next_commit(&self, err: SysError) {
        *self.fail_commit.lock() = Some(err);
    }

    pub fn refs(&self) -> isize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::Acquire)
    }
}

impl CacheStore for RecordingStore {
    fn commit(&self, size: usize) -> SysResult<()> {
        if let Some(err) = self.fail_commit.lock().take() {
            return Err(err);
        }
        self.commits.lock().push(size);
        Ok(())
    }

    fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::AcqRel);
    }

    fn acquire_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    fn release_ref(&self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }

    fn attach(&self, cache: CacheId) {
        *self.attached.lock() = Some(cache);
    }
}

/// A system backed by a small frame pool.
pub struct TestSystem {
    pub sys: Arc<VmSystem>,
    pub frames: Arc<FramePool>,
    pub notifier: Arc<SpinNotifier>,
}

impl TestSystem {
    pub fn new() -> Self {
        Self::with_cache_limit(config::mm::MAX_VM_CACHES)
    }

    pub fn with_cache_limit(limit: usize) -> Self {
        init_logger();
        let frames = Arc::new(FramePool::new(0x1000, TEST_FRAMES));
        let notifier = Arc::new(SpinNotifier::new());
        let sys = VmSystem::with_cache_limit(frames.clone(), notifier.clone(), limit);
        Self { sys, frames, notifier }
    }

    pub fn cache(&self) -> (Arc<Cache>, Arc<RecordingStore>) {
        let store = Arc::new(RecordingStore::default());
        let cache = Cache::create(&self.sys, store.clone()).unwrap();
        (cache, store)
    }
}

/// Allocates a page at each of `offsets`.
pub fn fill(cache: &Arc<Cache>, offsets: impl IntoIterator<Item = usize>) -> Vec<Arc<Page>> {
    let mut locked = cache.lock();
    offsets
        .into_iter()
        .map(|offset| locked.allocate_page(offset).unwrap())
        .collect()
}

pub fn link(source: &Arc<Cache>, consumer: &Arc<Cache>) {
    let mut locked = consumer.lock();
    source.add_consumer(&mut locked);
}

pub fn unlink(source: &Arc<Cache>, consumer: &Arc<Cache>) {
    let mut locked = consumer.lock();
    source.remove_consumer(&mut locked);
}

/// Returns the offsets of the resident pages of `cache`.
pub fn offsets(cache: &Arc<Cache>) -> Vec<usize> {
    cache.lock().pages().map(|page| page.cache_offset()).collect()
}

pub fn source_of(cache: &Arc<Cache>) -> Option<CacheId> {
    cache.lock().source().map(|source| source.id())
}

pub fn consumers_of(cache: &Arc<Cache>) -> Vec<CacheId> {
    cache.lock().consumers().iter().map(|consumer| consumer.id()).collect()
}

/// Checks that every resident page of `cache` points back at it and is
/// indexed under its offset.
pub fn assert_indexed(cache: &Arc<Cache>) {
    let locked = cache.lock();
    for page in locked.pages() {
        assert_eq!(page.cache_id(), Some(cache.id()));
        let indexed = cache.system().index().lookup(cache.id(), page.cache_offset()).unwrap();
        assert!(Arc::ptr_eq(&indexed, page));
    }
}
