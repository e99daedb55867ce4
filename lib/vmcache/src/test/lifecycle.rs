use std::sync::Arc;

use systype::SysError;

use super::mock::{RecordingStore, TEST_FRAMES, TestSystem, fill, link, offsets};
use crate::{AreaId, Cache, Page, PageState, frame::PageAllocator};

#[test]
fn create_and_release() {
    let ts = TestSystem::new();
    let (cache, store) = ts.cache();
    assert_eq!(cache.ref_count(), 1);
    assert_eq!(store.attached(), Some(cache.id()));
    assert_eq!(ts.sys.live_caches(), 1);

    cache.acquire_ref();
    cache.release_ref();
    assert_eq!(store.destroyed(), 0);

    cache.release_ref();
    assert_eq!(store.destroyed(), 1);
    assert_eq!(ts.sys.live_caches(), 0);
}

#[test]
fn create_fails_when_quota_is_used_up() {
    let ts = TestSystem::with_cache_limit(1);
    let (first, _) = ts.cache();
    let second = Cache::create(&ts.sys, Arc::new(RecordingStore::default()));
    assert_eq!(second.err(), Some(SysError::ENOMEM));

    first.release_ref();
    let (third, _) = ts.cache();
    third.release_ref();
}

#[test]
fn unreferenced_ref_fails_once_deleted() {
    let ts = TestSystem::new();
    let (cache, _) = ts.cache();
    assert!(cache.acquire_unreferenced_ref());
    assert_eq!(cache.ref_count(), 2);
    cache.release_ref();
    cache.release_ref();
    assert!(!cache.acquire_unreferenced_ref());
    assert_eq!(cache.ref_count(), 0);
}

#[test]
fn delete_frees_every_page() {
    let ts = TestSystem::new();
    let (cache, store) = ts.cache();
    let pages = fill(&cache, 0..5);
    assert_eq!(ts.frames.free_frames(), TEST_FRAMES - 5);
    assert_eq!(ts.sys.index().len(), 5);

    cache.release_ref();
    assert_eq!(store.destroyed(), 1);
    assert!(ts.sys.index().is_empty());
    assert_eq!(ts.frames.free_frames(), TEST_FRAMES);
    for page in pages {
        assert_eq!(page.state(), PageState::Free);
        assert_eq!(page.cache_id(), None);
    }
}

#[test]
#[should_panic]
fn delete_with_mapped_page_is_fatal() {
    let ts = TestSystem::new();
    let (cache, _) = ts.cache();
    fill(&cache, [0])[0].map();
    cache.release_ref();
}

#[test]
fn insert_lookup_remove() {
    let ts = TestSystem::new();
    let (cache, _) = ts.cache();
    let page = Arc::new(Page::new(0x42));
    {
        let mut locked = cache.lock();
        locked.insert_page(page.clone(), 3);
        assert!(Arc::ptr_eq(&locked.lookup_page(3).unwrap(), &page));
        assert_eq!(page.cache_id(), Some(cache.id()));
        assert_eq!(page.cache_offset(), 3);
        assert_eq!(locked.page_count(), 1);

        let removed = locked.remove_page(&page);
        assert!(Arc::ptr_eq(&removed, &page));
        assert!(locked.lookup_page(3).is_none());
        assert_eq!(page.cache_id(), None);
        assert_eq!(locked.page_count(), 0);
    }
    cache.release_ref();
}

#[test]
#[should_panic]
fn second_page_at_same_offset_is_fatal() {
    let ts = TestSystem::new();
    let (cache, _) = ts.cache();
    let mut locked = cache.lock();
    locked.insert_page(Arc::new(Page::new(1)), 3);
    locked.insert_page(Arc::new(Page::new(2)), 3);
}

#[test]
#[should_panic]
fn page_owned_by_another_cache_is_fatal() {
    let ts = TestSystem::new();
    let (first, _) = ts.cache();
    let (second, _) = ts.cache();
    let page = fill(&first, [0]).remove(0);
    second.lock().insert_page(page, 1);
}

#[test]
fn every_resident_page_is_indexed() {
    let ts = TestSystem::new();
    let (first, _) = ts.cache();
    let (second, _) = ts.cache();
    fill(&first, [0, 1, 2, 7]);
    fill(&second, [0, 2, 9]);
    {
        let mut locked = first.lock();
        let page = locked.lookup_page(1).unwrap();
        locked.free_page(&page);
    }

    for cache in [&first, &second] {
        super::mock::assert_indexed(cache);
        let resident = offsets(cache);
        for offset in 0..10 {
            let indexed = cache.lock().lookup_page(offset).is_some();
            assert_eq!(indexed, resident.contains(&offset), "{:?} offset {}", cache.id(), offset);
        }
    }
    assert_eq!(ts.sys.index().len(), 6);

    first.release_ref();
    second.release_ref();
    assert!(ts.sys.index().is_empty());
}

#[test]
fn areas_hold_references_and_pin_the_store() {
    let ts = TestSystem::new();
    let (cache, store) = ts.cache();
    cache.insert_area(AreaId(1));
    cache.insert_area(AreaId(2));
    assert_eq!(cache.ref_count(), 3);
    assert_eq!(store.refs(), 1);
    assert_eq!(cache.info().area_count, 2);

    cache.release_ref();
    cache.remove_area(AreaId(1));
    assert_eq!(store.refs(), 1);
    assert_eq!(store.destroyed(), 0);

    cache.remove_area(AreaId(2));
    assert_eq!(store.refs(), 0);
    assert_eq!(store.destroyed(), 1);
}

#[test]
#[should_panic]
fn removing_unknown_area_is_fatal() {
    let ts = TestSystem::new();
    let (cache, _) = ts.cache();
    cache.remove_area(AreaId(7));
}

#[test]
#[should_panic]
fn deleting_with_consumers_is_fatal() {
    let ts = TestSystem::new();
    let (source, _) = ts.cache();
    let (consumer, _) = ts.cache();
    link(&source, &consumer);
    // Drops the consumer's reference along with the owner's.
    source.release_ref();
    source.release_ref();
}

#[test]
#[should_panic]
fn deleting_with_areas_is_fatal() {
    let ts = TestSystem::new();
    let (cache, _) = ts.cache();
    cache.insert_area(AreaId(1));
    // Drops the area's reference along with the owner's.
    cache.release_ref();
    cache.release_ref();
}

#[test]
#[should_panic]
fn linking_into_a_cycle_is_fatal() {
    let ts = TestSystem::new();
    let (upper, _) = ts.cache();
    let (lower, _) = ts.cache();
    link(&upper, &lower);
    link(&lower, &upper);
}

#[test]
fn deleting_a_consumer_releases_its_source() {
    let ts = TestSystem::new();
    let (source, source_store) = ts.cache();
    let (consumer, consumer_store) = ts.cache();
    link(&source, &consumer);
    assert_eq!(source.ref_count(), 2);
    assert_eq!(source_store.refs(), 1);

    source.release_ref();
    consumer.release_ref();
    assert_eq!(consumer_store.destroyed(), 1);
    assert_eq!(source_store.destroyed(), 1);
    assert_eq!(source_store.refs(), 0);
    assert_eq!(ts.sys.live_caches(), 0);
}

#[test]
fn info_describes_the_cache() {
    let ts = TestSystem::new();
    let (source, _) = ts.cache();
    let (consumer, _) = ts.cache();
    link(&source, &consumer);
    fill(&consumer, [4, 5]);
    consumer.lock().set_virtual_base(0x4000_0000);
    consumer.resize(0x6000).unwrap();

    let info = consumer.info();
    assert_eq!(info.id, consumer.id());
    assert_eq!(info.ref_count, 1);
    assert_eq!(info.page_count, 2);
    assert_eq!(info.consumer_count, 0);
    assert_eq!(info.source, Some(source.id()));
    assert_eq!(info.virtual_base, 0x4000_0000);
    assert_eq!(info.virtual_size, 0x6000);
    assert!(!info.collapsing);
    assert_eq!(source.info().consumer_count, 1);
    source.dump();

    consumer.release_ref();
    source.release_ref();
}

#[test]
fn teardown_waits_for_the_last_cache() {
    let ts = TestSystem::new();
    let (cache, _) = ts.cache();
    assert_eq!(ts.sys.teardown(), Err(SysError::EBUSY));

    cache.release_ref();
    assert_eq!(ts.sys.teardown(), Ok(()));
    let late = Cache::create(&ts.sys, Arc::new(RecordingStore::default()));
    assert_eq!(late.err(), Some(SysError::EPERM));
}

#[test]
fn allocation_fails_when_frames_run_out() {
    let ts = TestSystem::new();
    let (cache, _) = ts.cache();
    fill(&cache, 0..TEST_FRAMES);
    assert_eq!(ts.frames.allocate(&cache).err(), Some(SysError::ENOMEM));
    assert_eq!(cache.lock().allocate_page(TEST_FRAMES).err(), Some(SysError::ENOMEM));
    cache.release_ref();
    assert_eq!(ts.frames.free_frames(), TEST_FRAMES);
}

#[test]
fn locked_page_cache_follows_the_page() {
    let ts = TestSystem::new();
    let (cache, _) = ts.cache();
    let page = fill(&cache, [2]).remove(0);

    let found = ts.sys.with_locked_page_cache(&page, false, |locked| (locked.id(), locked.page_count()));
    assert_eq!(found, Some((cache.id(), 1)));
    assert_eq!(cache.ref_count(), 1);

    {
        let _held = cache.lock();
        assert_eq!(ts.sys.with_locked_page_cache(&page, true, |locked| locked.id()), None);
    }
    assert_eq!(cache.ref_count(), 1);

    cache.lock().free_page(&page);
    assert_eq!(ts.sys.with_locked_page_cache(&page, false, |locked| locked.id()), None);
    cache.release_ref();
}
