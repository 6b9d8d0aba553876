#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use] extern crate static_assertions;

pub mod config;
pub mod error;
pub mod utils;
pub mod vmx;
