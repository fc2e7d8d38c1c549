//! The page-table walker: canonical-address checks and the `page_lookup` /
//! `page_allocate` / `page_free` / `map_address` / `virt_to_phys` family.
//!
//! Every entry point here takes the page-table directory as an explicit
//! [`PhysAddress`] plus a `translate` closure from physical to virtual
//! address. That keeps the walker testable on a host build (where `translate`
//! can just be identity over a `Vec`-backed table) and lets the caller decide
//! whether "the directory" means the live CR3 table or a table under
//! construction before CR3 is switched.

use core::ptr;

use log::warn;
use static_assertions as sa;

use super::addr::{PhysAddress, VirtAddress};
use super::error::{MemError, MemResult};
use super::page::{Frame, Page, PAGE_SIZE};

pub const MAX_PHYS_ADDR_BITS: u32 = 52;
pub const MAX_PHYS_ADDR: PhysAddress = PhysAddress::from_raw(1 << MAX_PHYS_ADDR_BITS);

/// A single level of the page-table hierarchy: PML4, PDPT, PD, or PT. All four
/// levels share this layout.
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; 512],
}

impl PageTable {
    pub const fn zero() -> PageTable {
        PageTable {
            entries: [PageTableEntry::zero(); 512],
        }
    }

    pub fn entry(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }

    pub fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }
}

sa::assert_eq_size!(PageTable, [u8; 4096]);

const PAGE_TABLE_ENTRY_ADDR_MASK: u64 = ((1u64 << 40) - 1) << 12;

#[derive(Clone, Copy, Debug)]
#[repr(transparent)]
pub struct PageTableEntry {
    raw: u64,
}

impl PageTableEntry {
    pub const fn zero() -> PageTableEntry {
        PageTableEntry { raw: 0 }
    }

    pub fn present(&self) -> bool {
        self.raw & HwFlags::PRESENT.bits() != 0
    }

    pub fn is_large(&self) -> bool {
        self.raw & HwFlags::SIZE.bits() != 0
    }

    pub fn addr(&self) -> PhysAddress {
        PhysAddress::from_raw(self.raw & PAGE_TABLE_ENTRY_ADDR_MASK)
    }

    pub fn flags(&self) -> HwFlags {
        HwFlags::from_bits_truncate(self.raw)
    }

    pub fn set(&mut self, addr: PhysAddress, flags: HwFlags) {
        assert!(addr.is_aligned_to(PAGE_SIZE.as_raw()));
        assert!(addr < MAX_PHYS_ADDR);
        self.raw = addr.as_raw() | flags.bits();
    }

    pub fn clear(&mut self) {
        self.raw = 0;
    }
}

bitflags::bitflags! {
    /// Hardware page-table entry bits, per the architecture manual.
    pub struct HwFlags: u64 {
        const PRESENT     = 1 << 0;
        const WRITABLE    = 1 << 1;
        const USER        = 1 << 2;
        const WRITETHROUGH = 1 << 3;
        const UNCACHEABLE = 1 << 4;
        const ACCESSED    = 1 << 5;
        const DIRTY       = 1 << 6;
        /// Terminates the walk one level early (2 MiB at the PD, 1 GiB at the PDPT).
        const SIZE        = 1 << 7;
        const GLOBAL      = 1 << 8;
        const NX          = 1 << 63;
    }
}

bitflags::bitflags! {
    /// Request flags for [`page_lookup`] / [`page_allocate`] / [`page_free`] /
    /// [`map_address`]. Distinct from [`HwFlags`]: these describe what the
    /// *walk* should do, not what the final PTE looks like.
    pub struct WalkFlags: u32 {
        /// Create missing intermediate tables (and the leaf, for
        /// `page_allocate`) rather than treating an absent entry as a miss.
        const CREATE         = 1 << 0;
        /// Map as kernel-only (omit `USER`).
        const KERNEL         = 1 << 1;
        /// Omit `WRITABLE`.
        const READONLY       = 1 << 2;
        const WRITETHROUGH   = 1 << 3;
        const NOT_CACHEABLE  = 1 << 4;
        /// Leave the leaf entry's `PRESENT` bit clear (used for guard pages).
        const NOT_PRESENT    = 1 << 5;
        /// For `page_allocate`: use an already-supplied frame, don't pull one
        /// from the frame allocator.
        const NOALLOC        = 1 << 6;
        /// For `page_free`: also return the backing frame to the frame
        /// allocator.
        const FREE           = 1 << 7;
    }
}

impl WalkFlags {
    fn to_hw(self) -> HwFlags {
        let mut hw = HwFlags::PRESENT;
        if !self.contains(WalkFlags::READONLY) {
            hw |= HwFlags::WRITABLE;
        }
        if !self.contains(WalkFlags::KERNEL) {
            hw |= HwFlags::USER;
        }
        if self.contains(WalkFlags::WRITETHROUGH) {
            hw |= HwFlags::WRITETHROUGH;
        }
        if self.contains(WalkFlags::NOT_CACHEABLE) {
            hw |= HwFlags::UNCACHEABLE;
        }
        if self.contains(WalkFlags::NOT_PRESENT) {
            hw.remove(HwFlags::PRESENT);
        }
        hw
    }
}

/// True if `addr`'s bits 63:48 sign-extend bit 47, as the architecture
/// requires of every address actually used in a table walk.
pub fn is_canonical(addr: VirtAddress) -> bool {
    let raw = addr.as_raw();
    let bit47 = (raw >> 47) & 1;
    let upper = raw >> 48;
    if bit47 == 1 {
        upper == 0xffff
    } else {
        upper == 0
    }
}

/// Everything a walk needs to read and, if requested, extend the hierarchy.
pub struct Walker<'a, T, A>
where
    T: Fn(PhysAddress) -> VirtAddress,
    A: FnMut() -> MemResult<Frame>,
{
    pub translate: &'a T,
    pub alloc_frame: &'a mut A,
}

impl<'a, T, A> Walker<'a, T, A>
where
    T: Fn(PhysAddress) -> VirtAddress,
    A: FnMut() -> MemResult<Frame>,
{
    fn table_at(&self, phys: PhysAddress) -> *mut PageTable {
        (self.translate)(phys).as_mut_ptr()
    }

    /// Descends from `table`'s `index`th entry, creating an empty child table
    /// there if absent and `create` is set. Returns `None` on a miss that
    /// `create` didn't resolve, and an error if it hit a large-page entry
    /// where a parent table was expected, or if frame allocation failed.
    fn step<'t>(
        &mut self,
        table: &'t mut PageTable,
        index: usize,
        create: bool,
    ) -> MemResult<Option<&'t mut PageTable>> {
        let entry = table.entry_mut(index);

        if entry.present() {
            if entry.is_large() {
                warn!("paging: walk hit a large page where a parent table was expected");
                return Err(MemError::InvalidAddress);
            }
            return Ok(Some(unsafe { &mut *self.table_at(entry.addr()) }));
        }

        // This is the corrected form of the bit test the original source
        // got backwards: a fresh table is only created when CREATE is set.
        if !create {
            return Ok(None);
        }

        let frame = (self.alloc_frame)()?;
        let ptr = self.table_at(frame.start());
        unsafe {
            ptr::write(ptr, PageTable::zero());
        }
        entry.set(
            frame.start(),
            HwFlags::PRESENT | HwFlags::WRITABLE | HwFlags::USER,
        );

        Ok(Some(unsafe { &mut *ptr }))
    }

    fn walk_to_leaf<'t>(
        &mut self,
        root: &'t mut PageTable,
        page: Page,
        create: bool,
    ) -> MemResult<Option<&'t mut PageTable>> {
        let l3 = match self.step(root, page.l4_index(), create)? {
            Some(t) => t,
            None => return Ok(None),
        };
        let l2 = match self.step(l3, page.l3_index(), create)? {
            Some(t) => t,
            None => return Ok(None),
        };
        self.step(l2, page.l2_index(), create)
    }
}

/// Looks up the leaf entry mapping `virt` under `root`, without modifying the
/// hierarchy. Returns `Ok(None)` for an address with no mapping, and
/// `Err(InvalidAddress)` for a non-canonical address or a large-page entry in
/// the way.
pub fn page_lookup<'t, T>(
    root: &'t mut PageTable,
    translate: &T,
    virt: VirtAddress,
) -> MemResult<Option<&'t mut PageTableEntry>>
where
    T: Fn(PhysAddress) -> VirtAddress,
{
    if !is_canonical(virt) {
        return Err(MemError::InvalidAddress);
    }

    let page = Page::containing(virt);
    let mut no_alloc = || Err(MemError::NoFrame);
    let mut walker = Walker {
        translate,
        alloc_frame: &mut no_alloc,
    };

    let l1 = match walker.walk_to_leaf(root, page, false)? {
        Some(t) => t,
        None => return Ok(None),
    };

    let entry = l1.entry_mut(page.l1_index());
    if !entry.present() {
        return Ok(None);
    }
    Ok(Some(entry))
}

/// Establishes a mapping for `virt` to a fresh frame (or to `with_frame` if
/// `flags` contains `NOALLOC`), creating intermediate tables as needed. Flags
/// other than `CREATE`/`NOALLOC` shape the leaf entry's permissions.
pub fn page_allocate<T, A>(
    root: &mut PageTable,
    translate: &T,
    alloc_frame: &mut A,
    virt: VirtAddress,
    flags: WalkFlags,
    with_frame: Option<Frame>,
) -> MemResult<Frame>
where
    T: Fn(PhysAddress) -> VirtAddress,
    A: FnMut() -> MemResult<Frame>,
{
    if !is_canonical(virt) {
        return Err(MemError::InvalidAddress);
    }

    let page = Page::containing(virt);
    let mut walker = Walker {
        translate,
        alloc_frame,
    };

    // (flags & CREATE) == 0 means "don't create" — this is the operator the
    // original got backwards by negating the mask instead of the comparison.
    let create = flags.contains(WalkFlags::CREATE);

    let l1 = walker
        .walk_to_leaf(root, page, create)?
        .ok_or(MemError::InvalidAddress)?;

    let entry = l1.entry_mut(page.l1_index());
    if entry.present() {
        return Ok(Frame::containing(entry.addr()));
    }

    let frame = match with_frame {
        Some(f) => f,
        None => {
            if flags.contains(WalkFlags::NOALLOC) {
                return Err(MemError::BadArgument);
            }
            (walker.alloc_frame)()?
        }
    };

    entry.set(frame.start(), flags.to_hw());
    Ok(frame)
}

/// Tears down the mapping for `virt`. If `flags` contains `FREE`, the backing
/// frame is returned to `free_frame`; otherwise the frame is left mapped
/// nowhere and leaked (the caller is expected to log this, matching the
/// region-allocator peephole contract).
pub fn page_free<T>(
    root: &mut PageTable,
    translate: &T,
    virt: VirtAddress,
    flags: WalkFlags,
    mut free_frame: impl FnMut(Frame),
) -> MemResult<()>
where
    T: Fn(PhysAddress) -> VirtAddress,
{
    if !is_canonical(virt) {
        return Err(MemError::InvalidAddress);
    }

    let page = Page::containing(virt);
    let mut no_alloc = || Err(MemError::NoFrame);
    let mut walker = Walker {
        translate,
        alloc_frame: &mut no_alloc,
    };

    let l1 = match walker.walk_to_leaf(root, page, false)? {
        Some(t) => t,
        None => return Ok(()),
    };

    let entry = l1.entry_mut(page.l1_index());
    if !entry.present() {
        return Ok(());
    }

    let frame = Frame::containing(entry.addr());
    entry.clear();

    if flags.contains(WalkFlags::FREE) {
        free_frame(frame);
    }

    Ok(())
}

/// Maps `virt` to `phys` directly, for callers that already know which frame
/// they want mapped (boot-time identity maps, MMIO).
pub fn map_address<T, A>(
    root: &mut PageTable,
    translate: &T,
    alloc_frame: &mut A,
    virt: VirtAddress,
    phys: PhysAddress,
    flags: WalkFlags,
) -> MemResult<()>
where
    T: Fn(PhysAddress) -> VirtAddress,
    A: FnMut() -> MemResult<Frame>,
{
    page_allocate(
        root,
        translate,
        alloc_frame,
        virt,
        flags | WalkFlags::CREATE,
        Some(Frame::containing(phys)),
    )
    .map(|_| ())
}

/// Translates `virt` to its mapped physical address, or `Err(InvalidAddress)`
/// if there is no mapping.
pub fn virt_to_phys<T>(
    root: &mut PageTable,
    translate: &T,
    virt: VirtAddress,
) -> MemResult<PhysAddress>
where
    T: Fn(PhysAddress) -> VirtAddress,
{
    let entry = page_lookup(root, translate, virt)?.ok_or(MemError::InvalidAddress)?;
    let page_offset = virt.as_raw() & (PAGE_SIZE.as_raw() - 1);
    Ok(PhysAddress::from_raw(entry.addr().as_raw() | page_offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    // A host-side stand-in for physical memory: each "frame" is a boxed
    // table, keyed by a made-up address. `translate` and `alloc` only need a
    // shared `&FakeMemory`, so the same instance can back both the
    // `translate` and `alloc_frame` closures passed into a single walk.
    struct FakeMemory {
        tables: RefCell<HashMap<u64, Box<PageTable>>>,
        next_frame: Cell<u64>,
    }

    impl FakeMemory {
        fn new() -> Self {
            FakeMemory {
                tables: RefCell::new(HashMap::new()),
                next_frame: Cell::new(0x1000),
            }
        }

        fn translate(&self, phys: PhysAddress) -> VirtAddress {
            let tables = self.tables.borrow();
            let table = tables
                .get(&phys.as_raw())
                .expect("translate called on an address with no backing table");
            VirtAddress::from_raw(&**table as *const PageTable as u64)
        }

        fn alloc(&self) -> MemResult<Frame> {
            let addr = self.next_frame.get();
            self.next_frame.set(addr + PAGE_SIZE.as_raw());
            self.tables
                .borrow_mut()
                .insert(addr, Box::new(PageTable::zero()));
            Ok(Frame::new(PhysAddress::from_raw(addr)))
        }
    }

    #[test]
    fn canonical_addresses() {
        assert!(is_canonical(VirtAddress::from_raw(0)));
        assert!(is_canonical(VirtAddress::from_raw(0x0000_7fff_ffff_ffff)));
        assert!(is_canonical(VirtAddress::from_raw(0xffff_8000_0000_0000)));
        assert!(!is_canonical(VirtAddress::from_raw(0x0000_8000_0000_0000)));
        assert!(!is_canonical(VirtAddress::from_raw(0xffff_0000_0000_0000)));
    }

    #[test]
    fn walk_flags_translate_to_expected_hw_bits() {
        assert_eq!(
            WalkFlags::empty().to_hw(),
            HwFlags::PRESENT | HwFlags::USER | HwFlags::WRITABLE
        );
        assert_eq!(
            WalkFlags::KERNEL.to_hw(),
            HwFlags::PRESENT | HwFlags::WRITABLE
        );
        assert_eq!(
            (WalkFlags::KERNEL | WalkFlags::READONLY).to_hw(),
            HwFlags::PRESENT
        );
        assert_eq!(
            WalkFlags::NOT_PRESENT.to_hw(),
            HwFlags::USER | HwFlags::WRITABLE
        );
    }

    #[test]
    fn non_canonical_address_is_rejected() {
        let mut root = PageTable::zero();
        let translate = |p: PhysAddress| VirtAddress::from_raw(p.as_raw());
        let bad = VirtAddress::from_raw(0x0000_8000_0000_0000);
        assert!(matches!(
            page_lookup(&mut root, &translate, bad),
            Err(MemError::InvalidAddress)
        ));
    }

    #[test]
    fn allocate_then_lookup_then_free_round_trip() {
        let mem = FakeMemory::new();
        let root_frame = mem.alloc().unwrap();
        let root: &mut PageTable = unsafe { &mut *mem.translate(root_frame.start()).as_mut_ptr() };

        let translate = |p: PhysAddress| mem.translate(p);
        let mut alloc_frame = || mem.alloc();
        let virt = VirtAddress::from_raw(0x1000_0000);

        let frame = page_allocate(
            root,
            &translate,
            &mut alloc_frame,
            virt,
            WalkFlags::CREATE | WalkFlags::KERNEL,
            None,
        )
        .unwrap();

        let looked_up = page_lookup(root, &translate, virt).unwrap().unwrap();
        assert_eq!(looked_up.addr(), frame.start());
        assert!(!looked_up.flags().contains(HwFlags::USER));

        assert_eq!(
            virt_to_phys(root, &translate, virt).unwrap(),
            frame.start()
        );

        let mut freed = None;
        page_free(root, &translate, virt, WalkFlags::FREE, |f| freed = Some(f)).unwrap();
        assert_eq!(freed, Some(frame));
        assert!(page_lookup(root, &translate, virt).unwrap().is_none());
    }

    #[test]
    fn lookup_without_create_is_a_miss_not_an_error() {
        let mem = FakeMemory::new();
        let root_frame = mem.alloc().unwrap();
        let root: &mut PageTable = unsafe { &mut *mem.translate(root_frame.start()).as_mut_ptr() };
        let translate = |p: PhysAddress| mem.translate(p);

        let result = page_lookup(root, &translate, VirtAddress::from_raw(0x5000_0000));
        assert!(matches!(result, Ok(None)));
    }
}
