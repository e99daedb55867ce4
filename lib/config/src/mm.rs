//! Module defining constants related to memory management.

/// Page size
pub const PAGE_SIZE: usize = 4096;
/// Width of page offset
pub const PAGE_OFFSET_WIDTH: usize = 12;
/// Shift turning a byte offset into a page-granular cache offset
pub const PAGE_SHIFT: usize = PAGE_OFFSET_WIDTH;

/// Number of entries the page index reserves when it is created
pub const PAGE_INDEX_INITIAL_CAPACITY: usize = 1024;
/// Low bits dropped from a cache address before hashing.
///
/// A cache object is far larger than 64 bytes, so these bits carry no entropy.
pub const CACHE_ADDR_SHIFT: usize = 6;
/// Prime mixed into the shifted cache address
pub const CACHE_HASH_PRIME: u64 = 997;
/// Fibonacci multiplier spreading the combined key over all 64 hash bits
pub const CACHE_HASH_MULTIPLIER: u64 = 0x9e37_79b9_7f4a_7c15;

/// Maximum number of caches alive at the same time
pub const MAX_VM_CACHES: usize = 64 * 1024;
/// Number of page frames handed out by the default frame pool
pub const FRAME_POOL_PAGES: usize = 32 * 1024;
/// First page frame number of the default frame pool
pub const FRAME_POOL_START: usize = 0x8_0000;

/// Usage hint given to a page when it enters a cache
pub const PAGE_USAGE_FRESH: u8 = 0;
