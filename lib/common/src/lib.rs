#![cfg_attr(not(test), no_std)]

pub mod atomicflags;

#[doc(hidden)]
pub use paste;
