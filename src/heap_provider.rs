//! Backs the kernel's global heap allocator with the memory-management
//! core's heap region: each chunk request becomes one `mm::sbrk` call, since
//! `Heap`'s `CHUNK_SIZE` is exactly one page.

use core::mem::MaybeUninit;

use shared::memory::alloc::heap::{ChunkProvider, DEFAULT_CHUNK_SIZE};

use crate::mm;

pub struct RegionChunkProvider;

unsafe impl ChunkProvider<DEFAULT_CHUNK_SIZE> for RegionChunkProvider {
    fn allocate(&mut self, num_chunks: usize) -> *mut [MaybeUninit<u8>] {
        let size = mm::Length::from_raw((num_chunks * DEFAULT_CHUNK_SIZE) as u64);
        let addr = mm::sbrk(size.as_raw() as i64);
        core::ptr::slice_from_raw_parts_mut(addr.as_mut_ptr::<MaybeUninit<u8>>(), size.as_raw() as usize)
    }
}
