#![no_std]

pub mod mm;
