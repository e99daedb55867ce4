//! This crate is a derivative work based on the original code from the Phoenix OS project.
//! The original code is licensed under MIT License.
//! The original code can be found at https://github.com/djphoenix/phoenix-os.

#![cfg_attr(not(test), no_std)]

pub mod error;

pub use error::{SysError, SysResult};
