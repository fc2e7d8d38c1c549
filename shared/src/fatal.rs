//! The fatal-stop primitive.
//!
//! Higher layers (panic handler, `kernel_main`) may call [`fatal`] directly;
//! the memory core calls it only for the conditions §7 of the design
//! documents as unrecoverable. It never returns.

use core::fmt;

use log::error;

/// Fatal stop codes used by the memory core.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FatalCode {
    MemoryManagementError,
    KernelBadArgument,
    UnsupportedFunction,
    OutOfMemory,
}

impl fmt::Display for FatalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FatalCode::MemoryManagementError => "MEMORY_MANAGEMENT_ERROR",
            FatalCode::KernelBadArgument => "KERNEL_BAD_ARGUMENT_ERROR",
            FatalCode::UnsupportedFunction => "UNSUPPORTED_FUNCTION_ERROR",
            FatalCode::OutOfMemory => "OUT_OF_MEMORY",
        };
        f.write_str(s)
    }
}

/// Logs `code`/`module`/`args` at error level and parks the calling CPU.
/// Never returns.
#[cold]
pub fn fatal(code: FatalCode, module: &str, args: fmt::Arguments<'_>) -> ! {
    error!("fatal [{code}] in {module}: {args}");
    halt_forever();
}

#[cfg(target_arch = "x86_64")]
fn halt_forever() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn halt_forever() -> ! {
    loop {}
}

/// Convenience macro mirroring the `fatal(code, module, fmt, ...)` call shape
/// from the design documents.
#[macro_export]
macro_rules! fatal {
    ($code:expr, $module:expr, $($arg:tt)*) => {
        $crate::fatal::fatal($code, $module, format_args!($($arg)*))
    };
}
