//! Backing store interface.
//!
//! A store is what a cache delegates capacity and persistence to: anonymous
//! memory, a file, a device. The cache only needs to commission capacity when
//! it is resized, pin the store while areas or consumers depend on it, and
//! destroy it together with the cache.

use systype::SysResult;

use crate::cache::CacheId;

/// Backing store of a [`Cache`](crate::Cache).
pub trait CacheStore: Send + Sync {
    /// Commits backing capacity for `size` bytes.
    ///
    /// # Errors
    /// Any error is handed back unchanged to the caller of
    /// [`Cache::resize`](crate::Cache::resize), typically
    /// [`SysError::ENOSPC`](systype::SysError::ENOSPC) or
    /// [`SysError::ENOMEM`](systype::SysError::ENOMEM).
    fn commit(&self, size: usize) -> SysResult<()>;

    /// Tears the store down. Called once, when its cache is deleted.
    fn destroy(&self);

    /// Pins the store on behalf of a new consumer cache or the first area.
    fn acquire_ref(&self);

    /// Drops a pin taken by [`acquire_ref`](Self::acquire_ref).
    fn release_ref(&self);

    /// Binds the store to the cache created on top of it.
    fn attach(&self, _cache: CacheId) {}
}
