//! Allocators that sit above the frame/page layer: the kernel heap's
//! free-list allocator lives in [`heap`].

pub mod heap;
