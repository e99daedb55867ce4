//! Protocol-level tests of the cache subsystem.

mod lifecycle;
pub(crate) mod mock;
