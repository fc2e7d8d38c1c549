//! The permanent physical-memory window: every physical byte is reachable at
//! `phys | WINDOW_BASE` via 2 MiB pages installed once at bootstrap. Because
//! the mapping is a pure OR of a fixed high bit, `window` needs no page-table
//! walk and can't fail except by asking for more than the window covers.

use crate::fatal::{fatal, FatalCode};

use super::addr::{Length, PhysAddress, VirtAddress};

/// PML4 slot 511 — the top of the canonical higher half.
pub const WINDOW_BASE: VirtAddress = VirtAddress::from_raw(0xffff_ff80_0000_0000);

/// 128 GiB, the span of a single PML4 slot's worth of 2 MiB pages doubled up
/// with 1 GiB PDPT entries; see the bootstrap sequence for how this is built.
pub const WINDOW_SIZE: Length = Length::from_raw(128 * 1024 * 1024 * 1024);

/// Returns the virtual address aliasing the physical range `[phys, phys +
/// len)`. Fatal if any part of that range falls outside the window — callers
/// are expected to only ever window-map real, bootstrap-accounted RAM.
pub fn window(phys: PhysAddress, len: Length) -> VirtAddress {
    let end = match phys.offset_by_checked(len) {
        Some(end) => end,
        None => fatal(
            FatalCode::MemoryManagementError,
            "memory::window",
            format_args!("window({phys:?}, {len:?}) overflows"),
        ),
    };

    if end - PhysAddress::zero() > WINDOW_SIZE {
        fatal(
            FatalCode::MemoryManagementError,
            "memory::window",
            format_args!("window({phys:?}, {len:?}) exceeds the {WINDOW_SIZE:?} window"),
        );
    }

    WINDOW_BASE + Length::from_raw(phys.as_raw())
}

/// No-op: the window is a permanent identity alias with no per-mapping state
/// to release. Exists so callers that pair every `window` with an unmap don't
/// need a special case for this allocator.
pub fn window_unmap(_phys: PhysAddress, _len: Length) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_a_fixed_offset() {
        let a = window(PhysAddress::from_raw(0x1000), Length::from_raw(0x1000));
        let b = window(PhysAddress::from_raw(0x2000), Length::from_raw(0x1000));
        assert_eq!(b.as_raw() - a.as_raw(), 0x1000);
        assert_eq!(a.as_raw(), WINDOW_BASE.as_raw() + 0x1000);
    }

    #[test]
    fn window_unmap_is_harmless() {
        window_unmap(PhysAddress::from_raw(0x1000), Length::from_raw(0x1000));
    }
}
