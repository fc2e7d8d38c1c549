use super::*;

use core::fmt::Write;
use core::panic::PanicInfo;

use lazy_static::lazy_static;
use log::{error, info};
use multiboot2 as mb2;
use x86_64::instructions::interrupts;

const VMEM: *mut u8 = 0xB8000 as *mut u8;

#[global_allocator]
pub(crate) static HEAP_ALLOCATOR: shared::memory::alloc::heap::CheckedHeap<heap_provider::RegionChunkProvider> =
    shared::memory::alloc::heap::CheckedHeap::new(shared::memory::alloc::heap::Heap::new(
        heap_provider::RegionChunkProvider,
    ));

#[no_mangle]
pub extern "C" fn kernel_entry(mbinfo_addr: u64) -> ! {
    init_logger();

    info!("Multiboot info: {mbinfo_addr:X}");
    info!("{:X?}", *MB2_HEADER);

    let mbinfo =
        unsafe { mb2::BootInformation::load(mbinfo_addr as *const mb2::BootInformationHeader) }
            .unwrap();
    info!("{:?}", mbinfo);

    interrupts::disable();

    info!("In kernel");

    gdt::init();
    info!("Set up GDT");

    mm::init(&mbinfo);
    info!("Memory management initialized");

    kernel_main();
}

pub fn kernel_main() -> ! {
    info!("In kernel_main");

    let driver_window = mm::region_alloc_driver(mm::Length::from_raw(4096));
    info!("driver region scratch page at {driver_window:?}");
    mm::region_free_driver(driver_window, mm::Length::from_raw(4096));

    let vec: alloc::vec::Vec<u32> = (0..100).collect();
    let mut string = alloc::string::String::new();
    for i in vec.iter() {
        write!(&mut string, "{i} ").unwrap();
    }

    info!("{string}");

    let raw = heap_backing::malloc(64);
    info!("facade malloc(64) = {raw:?}, capabilities = {:?}", heap_backing::alloc_info());
    unsafe { heap_backing::free(raw) };

    halt_loop();
}

fn halt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

extern "C" {
    // These point to valid memory, but they must not be dereferenced as is.
    static _binary_mb2_header_start: core::ffi::c_void;
    static _binary_mb2_header_end: core::ffi::c_void;
    static _binary_mb2_header_size: core::ffi::c_void;
}

#[used]
static MB2_HEADER_START: &core::ffi::c_void = unsafe { &_binary_mb2_header_start };
#[used]
static MB2_HEADER_END: &core::ffi::c_void = unsafe { &_binary_mb2_header_end };
#[used]
static MB2_HEADER_SIZE: &core::ffi::c_void = unsafe { &_binary_mb2_header_size };

lazy_static! {
    static ref MB2_HEADER: &'static [u8] = unsafe {
        core::slice::from_raw_parts(
            MB2_HEADER_START as *const _ as *const u8,
            MB2_HEADER_SIZE as *const _ as usize,
        )
    };
}

cfg_if::cfg_if! {
    if #[cfg(feature = "qemu_debugcon")] {
        use shared::log::{LogTee, LogSink, QemuDebugWriter};
        use shared::vga::VgaWriter;
        lazy_static! {
            static ref LOGGER: LogTee<LogSink<QemuDebugWriter>, LogSink<VgaWriter>> = unsafe { LogTee(LogSink::new(QemuDebugWriter::new()), LogSink::new(VgaWriter::new(VMEM))) };
        }
    } else {
        use shared::log::LogSink;
        use shared::vga::VgaWriter;
        lazy_static! {
            static ref LOGGER: LogSink<VgaWriter> = unsafe { LogSink::new(VgaWriter::new(VMEM)) };
        }
    }
}

fn init_logger() {
    log::set_logger(&*LOGGER).unwrap();
    log::set_max_level(log::LevelFilter::Info);
}

#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
    use shared::log::LogExt;

    // It is unlikely that we panicked while our LOGGER instance was locked, and
    // if we were, we'll likely triple fault anyway. Try to use the existing
    // LOGGER, and otherwise try to use a new VgaWriter.
    if !LOGGER.is_locked() {
        error!("{info}");
    } else {
        #[cfg(feature = "qemu_debugcon")]
        {
            let mut writer = unsafe { shared::log::QemuDebugWriter::new() };
            let _ = write!(&mut writer, "{info}");
        }

        let mut writer = unsafe { shared::vga::VgaWriter::new(VMEM) };
        let _ = write!(&mut writer, "{info}");
    }
    interrupts::disable();
    halt_loop();
}
