//! Lock primitives shared by the kernel libraries.
//!
//! Two flavours of the same spin mutex are provided:
//! - [`SpinLock`] only spins, and is used for objects whose critical sections may
//!   be long-ish (a VM cache and its page list).
//! - [`SpinNoIrqLock`] additionally masks interrupts on the local hart while held,
//!   so it can be taken from interrupt context. Keep its critical sections short.

#![cfg_attr(not(test), no_std)]

pub mod mutex;

pub use mutex::{
    MutexSupport, Spin, SpinLock, SpinNoIrq, SpinNoIrqLock,
    spin_mutex::{SpinMutex, SpinMutexGuard},
};
