//! Virtual memory caches.
//!
//! A [`Cache`] holds the resident pages that back a range of mapped memory.
//! Caches form a tree: a *consumer* cache derived from a *source* cache (after
//! a fork, for instance) only holds the pages it has privately copied, and
//! faults the rest through to its source. When a source cache ends up with
//! a single consumer and no mapping of its own, it is *collapsed* into that
//! consumer so copy-on-write chains do not grow without bound.
//!
//! All caches of a system share one [`VmSystem`], which owns:
//! - the [`PageIndex`], a hash table mapping `(cache, offset)` to the resident
//!   page, usable from interrupt context;
//! - the [`PageAllocator`] that supplies and reclaims pages;
//! - the [`WaitNotify`] primitive used to sleep on busy pages and caches.
//!
//! # Locking
//! Every cache has its own lock, and locks are always taken from a consumer
//! towards its source. The page index has a separate, interrupt-masking lock
//! that is only ever held for a single table operation. Collapsing is the only
//! place that needs a source and then its consumer locked; it marks the source
//! as collapsing, drops its lock, and re-takes both in consumer-first order.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
mod macros;

pub mod cache;
pub mod frame;
pub mod notify;
pub mod page;
pub mod page_index;
pub mod store;
pub mod system;

#[cfg(test)]
mod test;

pub use cache::{AreaId, Cache, CacheId, CacheInfo, LockedCache, collapse::CollapseGate};
pub use frame::{FramePool, PageAllocator};
pub use notify::{SpinNotifier, WaitNotify, WaitTarget, WaitTicket};
pub use page::{Page, PageFlags, PageState};
pub use page_index::{PageIndex, PageKey};
pub use store::CacheStore;
pub use system::VmSystem;
