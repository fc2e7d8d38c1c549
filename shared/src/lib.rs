#![no_std]
#![feature(allocator_api)]
#![feature(ptr_metadata)]
#![feature(pointer_is_aligned_to)]

extern crate alloc as alloc_crate;

pub mod fatal;
pub mod log;
pub mod memory;
pub mod vga;
