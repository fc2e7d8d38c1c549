//! The boot-info adapter: a thin reader over the Multiboot2 `BootInformation`
//! that translates its memory-map and ELF-section tags into the inputs
//! bootstrap needs. No policy lives here — just the Multiboot2-specific
//! parsing that a different boot protocol would have to replace wholesale.

use multiboot2 as mb2;

use shared::memory::addr::{Length, PhysAddress, PhysExtent};
use shared::memory::{Map, MapEntry, MemoryType};

/// The two bootstrap inputs named in the design documents: the top of
/// addressable RAM, and the first byte past the kernel image and whatever
/// bootloader-owned structures (the boot info blob itself, loaded modules)
/// must also be treated as reserved.
#[derive(Clone, Copy, Debug)]
pub struct EarlyInfo {
    pub memory_size: Length,
    pub kernel_end: PhysAddress,
}

/// Reads `memory_size` (the end of the highest memory-map entry) and
/// `kernel_end` (the first byte past both the kernel image and the boot info
/// blob) from `boot_info`. `kernel_image_end` is the kernel's own physical
/// end address (`get_kernel_phys_extent`'s end, from the linker symbols) —
/// Multiboot2 makes no guarantee about where the bootloader places the boot
/// info structure relative to the kernel image, so the two extents have to
/// be combined rather than one substituted for the other.
pub fn early_info(boot_info: &mb2::BootInformation, kernel_image_end: PhysAddress) -> EarlyInfo {
    let mem_map_tag = boot_info
        .memory_map_tag()
        .expect("boot loader did not supply a Multiboot2 memory map tag");

    let memory_size = mem_map_tag
        .all_memory_areas()
        .map(|area| area.start_address() + area.size())
        .max()
        .map(Length::from_raw)
        .expect("memory map tag had no entries");

    let boot_info_end = PhysAddress::from_raw(
        (boot_info.start_address() + boot_info.total_size()) as u64,
    );

    EarlyInfo {
        memory_size,
        kernel_end: kernel_image_end.max(boot_info_end),
    }
}

/// Translates the Multiboot2 memory map into `(extent, type)` pairs using the
/// `MemoryType` taxonomy the PFA bootstrap understands.
pub fn memory_map(boot_info: &mb2::BootInformation) -> impl Iterator<Item = (PhysExtent, MemoryType)> + '_ {
    let mem_map_tag = boot_info
        .memory_map_tag()
        .expect("boot loader did not supply a Multiboot2 memory map tag");

    mem_map_tag.all_memory_areas().map(|area| {
        let extent = PhysExtent::from_raw(area.start_address(), area.size());
        let mem_type = match area.typ() {
            mb2::MemoryAreaType::Available => MemoryType::Available,
            mb2::MemoryAreaType::Reserved => MemoryType::Reserved,
            mb2::MemoryAreaType::AcpiAvailable => MemoryType::Acpi,
            mb2::MemoryAreaType::ReservedHibernate => MemoryType::ReservedPreserveOnHibernation,
            mb2::MemoryAreaType::Defective => MemoryType::Defective,
        };
        (extent, mem_type)
    })
}

/// Builds the `shared::memory::Map` bootstrap and the PFA consume, from the
/// same tag `memory_map` reads.
pub fn build_map(boot_info: &mb2::BootInformation) -> Map {
    Map::from_entries(memory_map(boot_info).map(|(extent, mem_type)| MapEntry { extent, mem_type }))
}
