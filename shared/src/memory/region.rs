//! Region allocators: bump allocators over a fixed `[base, limit)` virtual
//! range, one each for the driver, DMA, and heap regions. All three share the
//! same `(base, limit, cursor, lock)` shape and the same growth path —
//! walking each new page with [`paging::page_allocate`], `CREATE`d and backed
//! by a fresh PFA frame — and differ only in which page flags that walk uses.
//!
//! Freeing is LIFO-only. `free` checks whether the freed range sits exactly
//! at the top of the region (`base + cursor - size`); if it does, the cursor
//! rewinds and the pages are unmapped via `page_free(FREE)`. If it doesn't —
//! something below the top was freed out of order — the pages stay mapped
//! and a warning is logged. This is a peephole optimization, not a general
//! allocator.

use log::warn;
use spin::Mutex;

use crate::fatal::{fatal, FatalCode};

use super::addr::{Length, PhysAddress, VirtAddress};
use super::error::{MemError, MemResult};
use super::page::PAGE_SIZE;
use super::paging::{self, WalkFlags};
use super::{pfa, window};

/// Per-region page-flag preset, applied to every page the region faults in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegionKind {
    /// Driver MMIO/scratch space: kernel-only, cacheable.
    Driver,
    /// DMA buffers: kernel-only, explicitly not cached.
    Dma,
    /// The kernel heap: kernel-only, grows and shrinks via [`Region::sbrk`].
    Heap,
}

impl RegionKind {
    fn walk_flags(self) -> WalkFlags {
        match self {
            RegionKind::Driver => WalkFlags::KERNEL,
            RegionKind::Dma => WalkFlags::KERNEL | WalkFlags::NOT_CACHEABLE,
            RegionKind::Heap => WalkFlags::KERNEL,
        }
    }
}

struct RegionState {
    base: VirtAddress,
    limit: VirtAddress,
    cursor: Length,
}

/// A bump-allocated virtual address region backed by the kernel page
/// directory.
pub struct Region {
    kind: RegionKind,
    state: Mutex<RegionState>,
}

fn translate(phys: PhysAddress) -> VirtAddress {
    window::window(phys, Length::from_raw(PAGE_SIZE.as_raw()))
}

impl Region {
    pub const fn new(kind: RegionKind, base: VirtAddress, limit: VirtAddress) -> Region {
        Region {
            kind,
            state: Mutex::new(RegionState {
                base,
                limit,
                cursor: Length::from_raw(0),
            }),
        }
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn base(&self) -> VirtAddress {
        self.state.lock().base
    }

    pub fn cursor(&self) -> Length {
        self.state.lock().cursor
    }

    /// Maps `count` fresh pages starting at the current cursor with this
    /// region's flag preset, advances the cursor, and returns the address of
    /// the allocation. Fatal if the region would be exhausted — callers are
    /// expected to size regions so ordinary operation never hits this.
    fn map_forward(&self, dir: PhysAddress, state: &mut RegionState, count: u64) -> VirtAddress {
        let addr = state.base + state.cursor;
        let grown = Length::from_raw(count * PAGE_SIZE.as_raw());

        if state.base + (state.cursor + grown) > state.limit {
            fatal(
                FatalCode::MemoryManagementError,
                "memory::region",
                format_args!("region exhausted: cursor {:?} + {grown:?} > limit {:?}", state.cursor, state.limit),
            );
        }

        let root_ptr = translate(dir).as_mut_ptr::<paging::PageTable>();
        // SAFETY: `dir` is the kernel directory's physical address, always
        // reachable through the physmem window.
        let root: &mut paging::PageTable = unsafe { &mut *root_ptr };
        let flags = self.kind.walk_flags() | WalkFlags::CREATE;
        let mut alloc_frame = || pfa::alloc();

        for i in 0..count {
            let page_addr = addr + Length::from_raw(i * PAGE_SIZE.as_raw());
            paging::page_allocate(root, &translate, &mut alloc_frame, page_addr, flags, None)
                .unwrap_or_else(|e| {
                    fatal(
                        FatalCode::MemoryManagementError,
                        "memory::region",
                        format_args!("page_allocate failed during region growth: {e}"),
                    )
                });
        }

        state.cursor = state.cursor + grown;
        addr
    }

    /// Bumps the region forward by `size` bytes (rounded up to a page),
    /// mapping fresh pages with this region's flags, and returns the address
    /// of the new allocation.
    pub fn alloc(&self, dir: PhysAddress, size: Length) -> VirtAddress {
        let aligned = size.align_up(PAGE_SIZE.as_raw());
        let count = aligned.as_raw() / PAGE_SIZE.as_raw();
        let mut state = self.state.lock();
        self.map_forward(dir, &mut state, count)
    }

    /// Frees `[addr, addr+size)` if it's exactly the most recent allocation;
    /// otherwise logs a warning and leaves the pages mapped.
    pub fn free(&self, dir: PhysAddress, addr: VirtAddress, size: Length) {
        let mut state = self.state.lock();
        let aligned = size.align_up(PAGE_SIZE.as_raw());

        let top = state.base + state.cursor;
        let would_be_base = top - aligned;

        if would_be_base != addr {
            warn!(
                "region: out-of-order free of {addr:?} ({size:?}), leaking the mapping \
                 (region top is at {top:?})"
            );
            return;
        }

        let root_ptr = translate(dir).as_mut_ptr::<paging::PageTable>();
        let root: &mut paging::PageTable = unsafe { &mut *root_ptr };
        let count = aligned.as_raw() / PAGE_SIZE.as_raw();

        for i in 0..count {
            let page_addr = addr + Length::from_raw(i * PAGE_SIZE.as_raw());
            paging::page_free(root, &translate, page_addr, WalkFlags::FREE, pfa::free)
                .unwrap_or_else(|e| {
                    fatal(
                        FatalCode::MemoryManagementError,
                        "memory::region",
                        format_args!("page_free failed during region shrink: {e}"),
                    )
                });
        }

        state.cursor = state.cursor - aligned;
    }

    /// `sbrk`-style cursor adjustment. `delta == 0` returns the current break
    /// without moving it. `delta`, when nonzero, must be a page multiple or
    /// this is fatal. Positive `delta` grows (skipping, with a warning, any
    /// target page that's already mapped); negative `delta` retracts exactly
    /// that many bytes, freeing pages as it goes. Returns the break *before*
    /// the adjustment in both directions.
    pub fn sbrk(&self, dir: PhysAddress, delta: i64) -> VirtAddress {
        if delta == 0 {
            let state = self.state.lock();
            return state.base + state.cursor;
        }

        if (delta.unsigned_abs()) % PAGE_SIZE.as_raw() != 0 {
            fatal(
                FatalCode::KernelBadArgument,
                "memory::region",
                format_args!("sbrk({delta}) is not a page multiple"),
            );
        }

        let mut state = self.state.lock();
        let old_break = state.base + state.cursor;

        if delta > 0 {
            let count = (delta as u64) / PAGE_SIZE.as_raw();
            let root_ptr = translate(dir).as_mut_ptr::<paging::PageTable>();
            let root: &mut paging::PageTable = unsafe { &mut *root_ptr };
            let flags = self.kind.walk_flags() | WalkFlags::CREATE;
            let mut alloc_frame = || pfa::alloc();

            let grown = Length::from_raw(delta as u64);
            if state.base + (state.cursor + grown) > state.limit {
                fatal(
                    FatalCode::MemoryManagementError,
                    "memory::region",
                    format_args!("sbrk would exceed region limit"),
                );
            }

            for i in 0..count {
                let page_addr = old_break + Length::from_raw(i * PAGE_SIZE.as_raw());
                match paging::page_lookup(root, &translate, page_addr) {
                    Ok(Some(_)) => {
                        warn!("region: sbrk growth target {page_addr:?} already mapped, skipping");
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => fatal(
                        FatalCode::MemoryManagementError,
                        "memory::region",
                        format_args!("sbrk lookup failed: {e}"),
                    ),
                }
                paging::page_allocate(root, &translate, &mut alloc_frame, page_addr, flags, None)
                    .unwrap_or_else(|e| {
                        fatal(
                            FatalCode::MemoryManagementError,
                            "memory::region",
                            format_args!("sbrk growth failed: {e}"),
                        )
                    });
            }

            state.cursor = state.cursor + grown;
        } else {
            let shrink = Length::from_raw(delta.unsigned_abs());
            if shrink > state.cursor {
                fatal(
                    FatalCode::KernelBadArgument,
                    "memory::region",
                    format_args!("sbrk({delta}) retracts below the region base"),
                );
            }

            let count = delta.unsigned_abs() / PAGE_SIZE.as_raw();
            let root_ptr = translate(dir).as_mut_ptr::<paging::PageTable>();
            let root: &mut paging::PageTable = unsafe { &mut *root_ptr };

            for i in 0..count {
                let page_addr = old_break - Length::from_raw((i + 1) * PAGE_SIZE.as_raw());
                paging::page_free(root, &translate, page_addr, WalkFlags::FREE, pfa::free)
                    .unwrap_or_else(|e| {
                        fatal(
                            FatalCode::MemoryManagementError,
                            "memory::region",
                            format_args!("sbrk shrink failed: {e}"),
                        )
                    });
            }

            state.cursor = state.cursor - shrink;
        }

        old_break
    }

    /// Advances the cursor by `size` (rounded up to a page) without mapping
    /// anything. Bootstrap-only: used once, for the PFA bitmap storage the
    /// address-space construction already mapped directly before the region
    /// machinery existed to do it.
    pub fn skip_mapped(&self, size: Length) {
        let aligned = size.align_up(PAGE_SIZE.as_raw());
        let mut state = self.state.lock();
        state.cursor = state.cursor + aligned;
    }
}

/// Non-fatal variant of [`Region::alloc`], used by call sites (mainly the
/// allocator facade's capacity probing) that want to handle exhaustion as an
/// ordinary error instead of taking down the kernel.
pub fn checked_alloc(region: &Region, dir: PhysAddress, size: Length) -> MemResult<VirtAddress> {
    let aligned = size.align_up(PAGE_SIZE.as_raw());
    let state = region.state.lock();
    if state.base + (state.cursor + aligned) > state.limit {
        return Err(MemError::RegionExhausted);
    }
    drop(state);
    Ok(region.alloc(dir, size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_presets_match_the_per_region_contract() {
        assert_eq!(RegionKind::Driver.walk_flags(), WalkFlags::KERNEL);
        assert_eq!(
            RegionKind::Dma.walk_flags(),
            WalkFlags::KERNEL | WalkFlags::NOT_CACHEABLE
        );
        assert_eq!(RegionKind::Heap.walk_flags(), WalkFlags::KERNEL);
    }

    #[test]
    fn region_starts_empty() {
        let r = Region::new(
            RegionKind::Heap,
            VirtAddress::from_raw(0x1000_0000),
            VirtAddress::from_raw(0x2000_0000),
        );
        assert_eq!(r.cursor(), Length::from_raw(0));
        assert_eq!(r.base(), VirtAddress::from_raw(0x1000_0000));
    }
}
