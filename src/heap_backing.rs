//! Wires the kernel heap allocator into the generic allocator facade
//! (`alloc_facade`), so the C-style `malloc`/`realloc`/`free` surface has a
//! real backing allocator instead of standing unused.
//!
//! `CheckedHeap` tracks no per-allocation size (its `dealloc`/`deallocate` are
//! documented no-ops), so `realloc` can't ask it for the old size the way a
//! sizing allocator would. Every allocation here is instead prefixed with a
//! small header recording its own requested size, the same trick most
//! freestanding `malloc` implementations use; `realloc` and `free` read it
//! back out rather than trusting the backing heap to remember.

use core::alloc::{Allocator, Layout};
use core::ffi::c_void;
use core::ptr::NonNull;

use shared::memory::alloc::heap::CheckedHeap;

use crate::alloc_facade::{BackingAllocator, Capabilities, Facade, FacadeError, ProfileSnapshot};
use crate::heap_provider::RegionChunkProvider;
use crate::kmain::HEAP_ALLOCATOR;

const HEADER_ALIGN: usize = core::mem::size_of::<usize>();

fn header_layout(payload_size: usize) -> Option<Layout> {
    Layout::from_size_align(HEADER_ALIGN.checked_add(payload_size)?, HEADER_ALIGN).ok()
}

/// Backs the facade with the kernel's own global heap.
pub struct HeapBackingAllocator(&'static CheckedHeap<RegionChunkProvider>);

unsafe impl BackingAllocator for HeapBackingAllocator {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            name: "heap",
            version: 1,
            // The small-block free lists have no page-aligned allocation path.
            supports_valloc: false,
            supports_profile: true,
        }
    }

    fn malloc(&self, size: usize) -> *mut c_void {
        if size == 0 {
            return core::ptr::null_mut();
        }
        let layout = match header_layout(size) {
            Some(l) => l,
            None => return core::ptr::null_mut(),
        };
        let block = match self.0.allocate(layout) {
            Ok(b) => b.as_ptr() as *mut u8,
            Err(_) => return core::ptr::null_mut(),
        };
        // SAFETY: `block` is freshly allocated and big enough for the header.
        unsafe { (block as *mut usize).write(size) };
        // SAFETY: `block` has at least `HEADER_ALIGN + size` bytes.
        unsafe { block.add(HEADER_ALIGN) as *mut c_void }
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        if ptr.is_null() {
            return self.malloc(size);
        }
        // SAFETY: `ptr` was returned by `malloc`/`realloc`, which always
        // leave a size header `HEADER_ALIGN` bytes before the payload.
        let old_size = unsafe { *(ptr as *const u8).sub(HEADER_ALIGN).cast::<usize>() };

        let new_ptr = self.malloc(size);
        if !new_ptr.is_null() {
            let copy_len = old_size.min(size);
            // SAFETY: both pointers are live allocations of at least
            // `copy_len` bytes each, and they don't overlap (`new_ptr` is a
            // distinct allocation from `ptr`).
            unsafe {
                core::ptr::copy_nonoverlapping(ptr as *const u8, new_ptr as *mut u8, copy_len);
            }
        }
        // SAFETY: `ptr` is still the pointer `malloc`/`realloc` returned.
        unsafe { self.free(ptr) };
        new_ptr
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        let header = unsafe { (ptr as *mut u8).sub(HEADER_ALIGN) };
        // SAFETY: `header` points at the size this allocation was made with.
        let size = unsafe { *(header as *const usize) };
        let layout = match header_layout(size) {
            Some(l) => l,
            None => return,
        };
        // SAFETY: `header` is the base pointer `malloc` obtained from `self.0`
        // for exactly `layout`, and it has not been freed since.
        unsafe {
            self.0
                .deallocate(NonNull::new_unchecked(header), layout);
        }
    }

    fn valloc(&self, _size: usize) -> Option<*mut c_void> {
        None
    }
}

pub static ALLOCATOR: Facade<HeapBackingAllocator> =
    Facade::new(HeapBackingAllocator(&HEAP_ALLOCATOR));

pub fn malloc(size: usize) -> *mut c_void {
    ALLOCATOR.malloc(size)
}

/// # Safety
/// `ptr` must be null or a pointer previously returned by this module and not
/// yet freed.
pub unsafe fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    unsafe { ALLOCATOR.realloc(ptr, size) }
}

pub fn calloc(elements: usize, size: usize) -> *mut c_void {
    ALLOCATOR.calloc(elements, size)
}

pub fn valloc(size: usize) -> Result<*mut c_void, FacadeError> {
    ALLOCATOR.valloc(size)
}

/// # Safety
/// `ptr` must be null or a pointer previously returned by this module and not
/// yet freed.
pub unsafe fn free(ptr: *mut c_void) {
    unsafe { ALLOCATOR.free(ptr) }
}

pub fn alloc_info() -> Capabilities {
    ALLOCATOR.capabilities()
}

pub fn profile_start(force: bool, now: u64) -> Result<(), FacadeError> {
    ALLOCATOR.start_profiling(force, now)
}

pub fn profile_stop(now: u64) -> Option<ProfileSnapshot> {
    ALLOCATOR.stop_profiling(now)
}
