//! The physical frame allocator.
//!
//! One bit per frame in a flat bitmap, set when the frame is in use and clear
//! when it's free, so a freshly zeroed bitmap (e.g. `.bss`) starts out fully
//! free. A single [`spin::Mutex`] guards the whole structure; there is no
//! per-CPU sharding.

use core::convert::TryInto;

use log::warn;
use spin::Mutex;

use super::addr::PhysAddress;
use super::error::{MemError, MemResult};
use super::page::{Frame, FrameRange, PAGE_SIZE};
use super::Map;

/// Bitmap-backed frame allocator. `bit = 1` means the frame is in use.
pub struct Pfa<'a> {
    bitmap: &'a mut [u8],
    /// Byte offset to resume the next linear search from, so a long run of
    /// allocations doesn't re-scan frames we already know are used.
    hint: usize,
}

impl<'a> Pfa<'a> {
    /// Builds an allocator over `bitmap`, which must be zeroed (all frames
    /// free) by the caller before any usable ranges are marked free with
    /// [`Pfa::mark_free`].
    ///
    /// # Safety
    ///
    /// `bitmap` must live for as long as this allocator and must not be
    /// aliased by anything else that walks physical memory.
    pub unsafe fn new(bitmap: &'a mut [u8]) -> Pfa<'a> {
        Pfa { bitmap, hint: 0 }
    }

    fn frame_to_offsets(frame: Frame) -> (usize, u32) {
        let addr_raw = frame.start().as_raw();
        (
            (addr_raw / PAGE_SIZE.as_raw() / 8) as usize,
            ((addr_raw / PAGE_SIZE.as_raw()) % 8) as u32,
        )
    }

    fn offsets_to_frame(byte_offset: usize, bit_offset: u32) -> Frame {
        Frame::new(PhysAddress::from_raw(
            (byte_offset as u64) * PAGE_SIZE.as_raw() * 8
                + (bit_offset as u64) * PAGE_SIZE.as_raw(),
        ))
    }

    /// Marks every frame touching `extent` as free. Used during bootstrap to
    /// populate the bitmap from the usable ranges of the boot memory map; not
    /// meant to be called once the allocator is in general use.
    pub fn mark_free(&mut self, extent: super::page::FrameRange) {
        let mut frame = extent.first();
        for _ in 0..extent.count() {
            let (byte_offset, bit_offset) = Self::frame_to_offsets(frame);
            self.bitmap[byte_offset] &= !(1 << bit_offset);
            frame = match frame.next(1) {
                Some(f) => f,
                None => break,
            };
        }
    }

    /// Marks every frame touching `extent` as used. Used during bootstrap to
    /// reserve the kernel image, the static tables, and the bitmap itself.
    pub fn mark_used(&mut self, extent: super::page::FrameRange) {
        let mut frame = extent.first();
        for _ in 0..extent.count() {
            let (byte_offset, bit_offset) = Self::frame_to_offsets(frame);
            self.bitmap[byte_offset] |= 1 << bit_offset;
            frame = match frame.next(1) {
                Some(f) => f,
                None => break,
            };
        }
    }

    fn search_from(&self, start_byte: usize) -> Option<(usize, u32)> {
        for i in start_byte..self.bitmap.len() {
            if self.bitmap[i] != 0xff {
                let bit_offset = (!self.bitmap[i]).trailing_zeros();
                return Some((i, bit_offset));
            }
        }
        None
    }

    /// Allocates a single free frame, starting the search at the last-free
    /// hint and wrapping around to the start of the bitmap.
    pub fn alloc(&mut self) -> MemResult<Frame> {
        let (byte_offset, bit_offset) = self
            .search_from(self.hint)
            .or_else(|| self.search_from(0))
            .ok_or(MemError::NoFrame)?;

        self.bitmap[byte_offset] |= 1 << bit_offset;
        self.hint = byte_offset;

        Ok(Self::offsets_to_frame(byte_offset, bit_offset))
    }

    /// Allocates `count` contiguous frames by scanning the bitmap for a run
    /// of `count` consecutive clear bits.
    pub fn alloc_contiguous(&mut self, count: u64) -> MemResult<FrameRange> {
        if count == 0 {
            return Err(MemError::BadArgument);
        }

        let total_frames = self.bitmap.len() as u64 * 8;
        let mut start_frame = 0u64;

        'outer: while start_frame + count <= total_frames {
            for i in 0..count {
                if self.bit(start_frame + i) {
                    start_frame += i + 1;
                    continue 'outer;
                }
            }

            for i in 0..count {
                self.set_bit(start_frame + i);
            }

            let first = Self::offsets_to_frame(0, 0);
            let first = first
                .next(start_frame)
                .expect("frame within bitmap bounds is always addressable");
            self.hint = (start_frame / 8) as usize;

            return Ok(FrameRange::new(first, count).expect("count checked nonzero above"));
        }

        Err(MemError::NoFrame)
    }

    fn bit(&self, frame_index: u64) -> bool {
        let byte = (frame_index / 8) as usize;
        let bit = (frame_index % 8) as u32;
        self.bitmap[byte] & (1 << bit) != 0
    }

    fn set_bit(&mut self, frame_index: u64) {
        let byte = (frame_index / 8) as usize;
        let bit = (frame_index % 8) as u32;
        self.bitmap[byte] |= 1 << bit;
    }

    /// Frees a previously allocated frame. A double free does not corrupt the
    /// bitmap or panic — it's logged and ignored, since the frame is already
    /// marked free and the caller has no further claim on it either way.
    pub fn free(&mut self, frame: Frame) {
        let (byte_offset, bit_offset) = Self::frame_to_offsets(frame);
        let mask = 1u8 << bit_offset;

        if self.bitmap[byte_offset] & mask == 0 {
            warn!(
                "pfa: double free of frame at {:?}, ignoring",
                frame.start()
            );
            return;
        }

        self.bitmap[byte_offset] &= !mask;

        let freed_byte: usize = byte_offset.try_into().unwrap();
        if freed_byte < self.hint {
            self.hint = freed_byte;
        }
    }
}

unsafe impl Send for Pfa<'_> {}

/// Global handle installed by the bootstrap sequence once the bitmap's backing
/// storage has a fixed address for the remainder of the kernel's lifetime.
pub static PFA: Mutex<Option<Pfa<'static>>> = Mutex::new(None);

/// Allocates a single frame from the global allocator.
///
/// # Panics
///
/// Panics if [`install`] has not been called yet.
pub fn alloc() -> MemResult<Frame> {
    PFA.lock()
        .as_mut()
        .expect("physical frame allocator used before installation")
        .alloc()
}

/// Allocates `count` contiguous frames from the global allocator.
///
/// # Panics
///
/// Panics if [`install`] has not been called yet.
pub fn alloc_contiguous(count: u64) -> MemResult<FrameRange> {
    PFA.lock()
        .as_mut()
        .expect("physical frame allocator used before installation")
        .alloc_contiguous(count)
}

/// Frees a frame via the global allocator.
///
/// # Panics
///
/// Panics if [`install`] has not been called yet.
pub fn free(frame: Frame) {
    PFA.lock()
        .as_mut()
        .expect("physical frame allocator used before installation")
        .free(frame)
}

/// Installs the bootstrap-built allocator as the global one. Called exactly
/// once, from the bootstrap sequence.
pub fn install(pfa: Pfa<'static>) {
    *PFA.lock() = Some(pfa);
}

/// Marks every frame in `range` used in an already-installed global
/// allocator. Used by bootstrap to reserve the kernel image, the boot info
/// blob, and the tables/bitmap storage it built before the PFA existed.
pub fn mark_range_used(range: FrameRange) {
    PFA.lock()
        .as_mut()
        .expect("physical frame allocator used before installation")
        .mark_used(range);
}

/// Marks every `Available` range in `map` free in an already-installed global
/// allocator.
pub fn mark_map_free(map: &Map) {
    use super::MemoryType;

    let mut guard = PFA.lock();
    let pfa = guard
        .as_mut()
        .expect("physical frame allocator used before installation");

    for extent in map.iter_type(MemoryType::Available) {
        if let Some(aligned) = extent.shrink_to_alignment(PAGE_SIZE.as_raw()) {
            let first = Frame::containing(aligned.address());
            let count = aligned.length().as_raw() / PAGE_SIZE.as_raw();
            if let Some(range) = FrameRange::new(first, count) {
                pfa.mark_free(range);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_avoids_reuse_until_freed() {
        let mut bitmap = [0u8; 4];
        let mut pfa = unsafe { Pfa::new(&mut bitmap) };

        let a = pfa.alloc().unwrap();
        let b = pfa.alloc().unwrap();
        assert_ne!(a, b);

        pfa.free(a);
        let c = pfa.alloc().unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn exhaustion_reports_no_frame() {
        let mut bitmap = [0xffu8; 1];
        let mut pfa = unsafe { Pfa::new(&mut bitmap) };
        assert_eq!(pfa.alloc(), Err(MemError::NoFrame));
    }

    #[test]
    fn double_free_is_tolerated_not_fatal() {
        let mut bitmap = [0u8; 1];
        let mut pfa = unsafe { Pfa::new(&mut bitmap) };

        let frame = pfa.alloc().unwrap();
        pfa.free(frame);
        // Second free of the same frame must not panic.
        pfa.free(frame);
    }

    #[test]
    fn contiguous_allocation_finds_a_run() {
        let mut bitmap = [0u8; 8];
        let mut pfa = unsafe { Pfa::new(&mut bitmap) };

        // Use up the first 3 frames individually so the run has to skip them.
        pfa.alloc().unwrap();
        pfa.alloc().unwrap();
        pfa.alloc().unwrap();

        let range = pfa.alloc_contiguous(4).unwrap();
        assert_eq!(range.count(), 4);
    }

    #[test]
    fn contiguous_allocation_rejects_zero_count() {
        let mut bitmap = [0u8; 16];
        let mut pfa = unsafe { Pfa::new(&mut bitmap) };
        assert_eq!(pfa.alloc_contiguous(0), Err(MemError::BadArgument));
    }

    #[test]
    fn contiguous_allocation_larger_than_bitmap_reports_no_frame() {
        let mut bitmap = [0u8; 16];
        let mut pfa = unsafe { Pfa::new(&mut bitmap) };
        assert_eq!(pfa.alloc_contiguous(129), Err(MemError::NoFrame));
    }

    #[test]
    fn contiguous_allocation_handles_runs_longer_than_64_frames() {
        let mut bitmap = [0u8; 16];
        let mut pfa = unsafe { Pfa::new(&mut bitmap) };
        let range = pfa.alloc_contiguous(100).unwrap();
        assert_eq!(range.count(), 100);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn alloc_free_bag_round_trips_to_initial_bitmap(ops in proptest::collection::vec(any::<bool>(), 0..64)) {
            let mut bitmap = [0u8; 8];
            let initial = bitmap;
            let mut pfa = unsafe { Pfa::new(&mut bitmap) };

            let mut outstanding = crate::alloc_crate::vec::Vec::new();
            for alloc_next in ops {
                if alloc_next || outstanding.is_empty() {
                    if let Ok(frame) = pfa.alloc() {
                        outstanding.push(frame);
                    }
                } else {
                    let frame = outstanding.swap_remove(0);
                    pfa.free(frame);
                }
            }
            for frame in outstanding {
                pfa.free(frame);
            }

            prop_assert_eq!(bitmap, initial);
        }
    }
}
