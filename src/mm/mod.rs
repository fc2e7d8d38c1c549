//! Kernel memory management: wires the shared walker, physical frame
//! allocator, physmem window, and region allocators into the one-time
//! address-space construction this kernel performs at boot, then exposes the
//! steady-state page and region API bound to the kernel's own directory.

pub mod boot;

pub use shared::memory::addr::*;
pub use shared::memory::page::*;

use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use log::info;
use multiboot2 as mb2;
use x86_64::structures::paging::PhysFrame;

use shared::fatal::{fatal, FatalCode};
use shared::memory::error::MemResult;
use shared::memory::paging::{self, HwFlags, PageTable, WalkFlags};
use shared::memory::region::{Region, RegionKind};
use shared::memory::{pfa, window};

const GIB: u64 = 1024 * 1024 * 1024;

/// PML4 slot 511: the permanent physical-memory window (`shared::memory::window`).
const WINDOW_PML4_SLOT: usize = 511;
/// PML4 slot 0: the identity-mapped kernel image.
const KERNEL_PML4_SLOT: usize = 0;

/// Self-imposed bootstrap limit: the kernel image, the window's own tables,
/// and the heap bitmap's backing pages must all fit below this mark so the
/// entry stub's temporary identity map of the first gigabyte can still reach
/// them. Fatal if exceeded.
const BOOTSTRAP_LIMIT: u64 = GIB;

const REGION_SLOT_BASE_RAW: u64 = 0xffff_ff00_0000_0000;
const DRIVER_BASE_RAW: u64 = REGION_SLOT_BASE_RAW;
const DRIVER_LIMIT_RAW: u64 = DRIVER_BASE_RAW + GIB;
const DMA_BASE_RAW: u64 = DRIVER_LIMIT_RAW;
const DMA_LIMIT_RAW: u64 = DMA_BASE_RAW + GIB;
const HEAP_BASE_RAW: u64 = DMA_LIMIT_RAW;
const HEAP_LIMIT_RAW: u64 = REGION_SLOT_BASE_RAW + 512 * GIB;

pub static DRIVER: Region = Region::new(
    RegionKind::Driver,
    VirtAddress::from_raw(DRIVER_BASE_RAW),
    VirtAddress::from_raw(DRIVER_LIMIT_RAW),
);
pub static DMA: Region = Region::new(
    RegionKind::Dma,
    VirtAddress::from_raw(DMA_BASE_RAW),
    VirtAddress::from_raw(DMA_LIMIT_RAW),
);
pub static HEAP: Region = Region::new(
    RegionKind::Heap,
    VirtAddress::from_raw(HEAP_BASE_RAW),
    VirtAddress::from_raw(HEAP_LIMIT_RAW),
);

static KERNEL_DIR: spin::Mutex<Option<PhysAddress>> = spin::Mutex::new(None);

fn kernel_dir() -> PhysAddress {
    KERNEL_DIR
        .lock()
        .expect("memory management used before mm::init")
}

/// Maps physical memory through the permanent window. The translator every
/// steady-state page-table operation uses once bootstrap has installed it.
fn translate(phys: PhysAddress) -> VirtAddress {
    window::window(phys, Length::from_raw(PAGE_SIZE.as_raw()))
}

/// Bootstrap-only translator: valid solely for physical addresses in the
/// first GiB, which the entry stub's temporary page tables identity-map
/// until [`init`] installs the real directory and switches CR3.
fn identity_translate(phys: PhysAddress) -> VirtAddress {
    VirtAddress::from_raw(phys.as_raw())
}

/// Hands out fresh frames for bootstrap's own page-table structures (and the
/// PFA bitmap storage) from a simple bump above `kernel_end`, before the real
/// frame allocator exists to do it. Every frame this allocates is later
/// marked used in the real PFA once it's installed.
struct EarlyFrames {
    next: PhysAddress,
}

impl EarlyFrames {
    fn new(start: PhysAddress) -> EarlyFrames {
        EarlyFrames { next: start }
    }

    fn alloc(&mut self) -> Frame {
        if self.next.as_raw() >= BOOTSTRAP_LIMIT {
            fatal(
                FatalCode::MemoryManagementError,
                "mm::init",
                format_args!("bootstrap ran out of identity-mapped frames below 1 GiB"),
            );
        }
        let frame = Frame::new(self.next);
        self.next = self.next + Length::from_raw(PAGE_SIZE.as_raw());
        frame
    }
}

fn zero_table(phys: PhysAddress) -> *mut PageTable {
    let ptr = identity_translate(phys).as_mut_ptr::<PageTable>();
    // SAFETY: valid while the entry stub's temporary identity map of the
    // first GiB is still live, which holds for every call site below.
    unsafe {
        ptr::write(ptr, PageTable::zero());
    }
    ptr
}

/// Initializes the memory management system. Must only be called once;
/// panics otherwise.
pub fn init(boot_info: &mb2::BootInformation) {
    static IS_INITIALIZED: AtomicBool = AtomicBool::new(false);
    assert!(!IS_INITIALIZED.swap(true, Ordering::SeqCst));

    let early_info = boot::early_info(boot_info, get_kernel_phys_extent().end_address());
    let kernel_end_aligned =
        PhysAddress::from_raw(early_info.kernel_end.as_raw()).align_up(PAGE_SIZE.as_raw());
    let map = boot::build_map(boot_info);

    let mut early = EarlyFrames::new(kernel_end_aligned);

    let root_frame = early.alloc();
    let root: &mut PageTable = unsafe { &mut *zero_table(root_frame.start()) };

    install_window(root, &mut early);
    identity_map_kernel(root, &mut early, kernel_end_aligned);

    let bitmap_bytes = bitmap_byte_len(early_info.memory_size);
    let bitmap_pages = Length::from_raw(bitmap_bytes)
        .align_up(PAGE_SIZE.as_raw())
        .as_raw()
        / PAGE_SIZE.as_raw();
    reserve_heap_bitmap(root, &mut early, bitmap_pages);

    info!(
        "bootstrap page tables built: root at {:?}, {bitmap_bytes} bitmap bytes",
        root_frame.start()
    );

    // SAFETY: `root_frame` is a fully-populated PML4 covering the window,
    // the kernel image, and the heap bitmap's backing pages; the entry
    // stub's temporary tables are no longer needed after this switch.
    unsafe {
        x86_64::registers::control::Cr3::write(
            PhysFrame::from_start_address(x86_64::PhysAddr::new(root_frame.start().as_raw()))
                .expect("root frame is page-aligned"),
            x86_64::registers::control::Cr3Flags::empty(),
        );
    }
    *KERNEL_DIR.lock() = Some(root_frame.start());

    // SAFETY: `reserve_heap_bitmap` mapped exactly this many bytes at
    // `HEAP_BASE_RAW`, and nothing else aliases it.
    let bitmap_slice: &'static mut [u8] = unsafe {
        core::slice::from_raw_parts_mut(
            VirtAddress::from_raw(HEAP_BASE_RAW).as_mut_ptr::<u8>(),
            bitmap_bytes as usize,
        )
    };
    bitmap_slice.fill(0xff);

    // SAFETY: `bitmap_slice` is the heap region's own backing storage,
    // mapped above and aliased nowhere else for the life of the kernel.
    unsafe {
        pfa::install(shared::memory::pfa::Pfa::new(bitmap_slice));
    }

    pfa::mark_map_free(&map);

    for reserved in [
        get_kernel_phys_extent(),
        PhysExtent::from_raw(boot_info.start_address() as u64, boot_info.total_size() as u64),
        PhysExtent::from_raw(0, 1024 * 1024),
        PhysExtent::from_range_exclusive(kernel_end_aligned, early.next),
    ] {
        pfa::mark_range_used(FrameRange::containing_extent(reserved));
    }

    HEAP.skip_mapped(Length::from_raw(bitmap_bytes));

    let root: &mut PageTable = unsafe { &mut *translate(root_frame.start()).as_mut_ptr() };
    strip_writable_from_text(root, boot_info);

    info!("memory management initialized");
}

fn bitmap_byte_len(memory_size: Length) -> u64 {
    let frames = memory_size.align_up(PAGE_SIZE.as_raw()).as_raw() / PAGE_SIZE.as_raw();
    (frames + 7) / 8
}

/// Step 2: installs the permanent physmem window at `WINDOW_PML4_SLOT`, built
/// from 2 MiB large pages so the whole of physical memory is covered by a
/// single PDPT.
fn install_window(root: &mut PageTable, early: &mut EarlyFrames) {
    let pdpt_frame = early.alloc();
    let pdpt: &mut PageTable = unsafe { &mut *zero_table(pdpt_frame.start()) };

    let pdpt_entries = (window::WINDOW_SIZE.as_raw() / GIB) as usize;
    for pdpt_index in 0..pdpt_entries {
        let pd_frame = early.alloc();
        let pd: &mut PageTable = unsafe { &mut *zero_table(pd_frame.start()) };

        for pd_index in 0..512usize {
            let phys = (pdpt_index as u64) * GIB + (pd_index as u64) * (2 * 1024 * 1024);
            pd.entry_mut(pd_index).set(
                PhysAddress::from_raw(phys),
                HwFlags::PRESENT | HwFlags::WRITABLE | HwFlags::SIZE,
            );
        }

        pdpt.entry_mut(pdpt_index)
            .set(pd_frame.start(), HwFlags::PRESENT | HwFlags::WRITABLE);
    }

    root.entry_mut(WINDOW_PML4_SLOT)
        .set(pdpt_frame.start(), HwFlags::PRESENT | HwFlags::WRITABLE);
}

/// Step 3: identity-maps `[0, kernel_end_aligned)` at `KERNEL_PML4_SLOT`,
/// using the generic walker so intermediate tables come from `early`.
fn identity_map_kernel(
    root: &mut PageTable,
    early: &mut EarlyFrames,
    kernel_end_aligned: PhysAddress,
) {
    let mut alloc_frame = || -> MemResult<Frame> { Ok(early.alloc()) };

    let page_count = kernel_end_aligned.as_raw() / PAGE_SIZE.as_raw();
    for i in 0..page_count {
        let addr = PhysAddress::from_raw(i * PAGE_SIZE.as_raw());
        paging::map_address(
            root,
            &identity_translate,
            &mut alloc_frame,
            VirtAddress::from_raw(addr.as_raw()),
            addr,
            WalkFlags::CREATE | WalkFlags::KERNEL,
        )
        .unwrap_or_else(|e| {
            fatal(
                FatalCode::MemoryManagementError,
                "mm::init",
                format_args!("identity-mapping the kernel image failed at {addr:?}: {e}"),
            )
        });
    }

    debug_assert!(root.entry(KERNEL_PML4_SLOT).present());
}

/// Step 4: maps the PFA bitmap's own backing pages at the heap base, with
/// physical frames drawn from the same bootstrap bump that built the tables
/// above it.
fn reserve_heap_bitmap(root: &mut PageTable, early: &mut EarlyFrames, bitmap_pages: u64) {
    let mut alloc_frame = || -> MemResult<Frame> { Ok(early.alloc()) };

    for i in 0..bitmap_pages {
        let virt = VirtAddress::from_raw(HEAP_BASE_RAW + i * PAGE_SIZE.as_raw());
        let phys = (alloc_frame)()
            .expect("bootstrap frame allocation cannot fail")
            .start();
        paging::map_address(
            root,
            &identity_translate,
            &mut alloc_frame,
            virt,
            phys,
            WalkFlags::CREATE | WalkFlags::KERNEL,
        )
        .unwrap_or_else(|e| {
            fatal(
                FatalCode::MemoryManagementError,
                "mm::init",
                format_args!("mapping the PFA bitmap storage failed at {virt:?}: {e}"),
            )
        });
    }
}

/// Step 9: clears the `writable` bit on every PTE covering an executable,
/// allocated ELF section (the kernel's `.text`).
fn strip_writable_from_text(root: &mut PageTable, boot_info: &mb2::BootInformation) {
    let sections = boot_info
        .elf_sections_tag()
        .expect("multiboot2 ELF sections tag missing");

    for section in sections.sections() {
        if !section.flags().contains(mb2::ElfSectionFlags::ALLOCATED) {
            continue;
        }
        if !section.flags().contains(mb2::ElfSectionFlags::EXECUTABLE) {
            continue;
        }

        let extent = VirtExtent::from_raw(section.start_address(), section.size());
        for page in PageRange::containing_extent(extent).iter() {
            match paging::page_lookup(root, &translate, page.start()) {
                Ok(Some(entry)) => {
                    let addr = entry.addr();
                    let flags = entry.flags() & !HwFlags::WRITABLE;
                    entry.set(addr, flags);
                }
                Ok(None) => {}
                Err(e) => fatal(
                    FatalCode::MemoryManagementError,
                    "mm::init",
                    format_args!("re-walking kernel text at {:?} failed: {e}", page.start()),
                ),
            }
        }
    }
}

/// MMIO mapping is not implemented. Kept as a real, named stub with the same
/// signature shape as [`map_address`] so future work has a fixed target.
pub fn map_mmio(_virt: VirtAddress, _phys: PhysAddress, _flags: WalkFlags) -> MemResult<()> {
    fatal(
        FatalCode::UnsupportedFunction,
        "mm::map_mmio",
        format_args!("MMIO mapping is not implemented"),
    )
}

pub fn map_address(virt: VirtAddress, phys: PhysAddress, flags: WalkFlags) -> MemResult<()> {
    let root: &mut PageTable = unsafe { &mut *translate(kernel_dir()).as_mut_ptr() };
    let mut alloc_frame = || pfa::alloc();
    paging::map_address(root, &translate, &mut alloc_frame, virt, phys, flags)
}

pub fn page_lookup(virt: VirtAddress) -> MemResult<Option<PhysAddress>> {
    let root: &mut PageTable = unsafe { &mut *translate(kernel_dir()).as_mut_ptr() };
    Ok(paging::page_lookup(root, &translate, virt)?.map(|e| e.addr()))
}

pub fn page_allocate(virt: VirtAddress, flags: WalkFlags) -> MemResult<Frame> {
    let root: &mut PageTable = unsafe { &mut *translate(kernel_dir()).as_mut_ptr() };
    let mut alloc_frame = || pfa::alloc();
    paging::page_allocate(root, &translate, &mut alloc_frame, virt, flags, None)
}

pub fn page_free(virt: VirtAddress, flags: WalkFlags) -> MemResult<()> {
    let root: &mut PageTable = unsafe { &mut *translate(kernel_dir()).as_mut_ptr() };
    paging::page_free(root, &translate, virt, flags, pfa::free)
}

pub fn virt_to_phys(virt: VirtAddress) -> MemResult<PhysAddress> {
    let root: &mut PageTable = unsafe { &mut *translate(kernel_dir()).as_mut_ptr() };
    paging::virt_to_phys(root, &translate, virt)
}

pub fn region_alloc_driver(size: Length) -> VirtAddress {
    DRIVER.alloc(kernel_dir(), size)
}

pub fn region_free_driver(addr: VirtAddress, size: Length) {
    DRIVER.free(kernel_dir(), addr, size)
}

pub fn region_alloc_dma(size: Length) -> VirtAddress {
    DMA.alloc(kernel_dir(), size)
}

pub fn region_free_dma(addr: VirtAddress, size: Length) {
    DMA.free(kernel_dir(), addr, size)
}

pub fn sbrk(delta: i64) -> VirtAddress {
    HEAP.sbrk(kernel_dir(), delta)
}

/// Given a physical address, returns the address at which it's reachable
/// through the permanent window.
#[inline]
pub fn phys_to_virt(phys: PhysAddress) -> VirtAddress {
    translate(phys)
}

#[inline]
pub fn get_kernel_phys_extent() -> PhysExtent {
    // SAFETY: `KERNEL_PHYS_BEGIN_SYM` and `KERNEL_PHYS_END_SYM` do not have
    // values, but they are zero-sized. The addresses are set appropriately by
    // the linker so we may get raw pointers to them, as long as we never
    // dereference them.
    unsafe {
        PhysExtent::from_raw_range_exclusive(
            &internal::KERNEL_PHYS_BEGIN_SYM as *const _ as usize as u64,
            &internal::KERNEL_PHYS_END_SYM as *const _ as usize as u64,
        )
    }
}

mod internal {
    extern "C" {
        #![allow(improper_ctypes)]
        // These may not be dereferenced. Only their address is meaningful.
        pub static KERNEL_PHYS_BEGIN_SYM: ();
        pub static KERNEL_PHYS_END_SYM: ();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_byte_len_rounds_up_to_whole_bytes() {
        assert_eq!(bitmap_byte_len(Length::from_raw(0)), 0);
        assert_eq!(bitmap_byte_len(Length::from_raw(PAGE_SIZE.as_raw())), 1);
        assert_eq!(bitmap_byte_len(Length::from_raw(PAGE_SIZE.as_raw() * 8)), 1);
        assert_eq!(bitmap_byte_len(Length::from_raw(PAGE_SIZE.as_raw() * 9)), 2);
        // Sub-page remainders still cost a whole frame in the bitmap.
        assert_eq!(bitmap_byte_len(Length::from_raw(PAGE_SIZE.as_raw() * 8 + 1)), 2);
    }

    #[test]
    fn early_frames_hands_out_sequential_page_aligned_frames() {
        let start = PhysAddress::from_raw(0x10_0000);
        let mut early = EarlyFrames::new(start);

        let a = early.alloc();
        let b = early.alloc();
        let c = early.alloc();

        assert_eq!(a.start(), start);
        assert_eq!(b.start(), start + Length::from_raw(PAGE_SIZE.as_raw()));
        assert_eq!(c.start(), start + Length::from_raw(2 * PAGE_SIZE.as_raw()));
    }

    #[test]
    fn region_slots_are_contiguous_and_ordered() {
        assert_eq!(DRIVER.base(), VirtAddress::from_raw(REGION_SLOT_BASE_RAW));
        assert_eq!(DRIVER_LIMIT_RAW, DMA_BASE_RAW);
        assert_eq!(DMA_LIMIT_RAW, HEAP_BASE_RAW);
        assert!(HEAP_LIMIT_RAW <= REGION_SLOT_BASE_RAW + 512 * GIB);
        assert_eq!(DRIVER.kind(), RegionKind::Driver);
        assert_eq!(DMA.kind(), RegionKind::Dma);
        assert_eq!(HEAP.kind(), RegionKind::Heap);
    }

    #[test]
    fn window_and_region_slots_do_not_overlap() {
        let window_slot_base = 0xffff_ff80_0000_0000u64;
        assert!(HEAP_LIMIT_RAW <= window_slot_base);
    }
}
