//! Error taxonomy for the virtual-memory core.
//!
//! Conditions that break an address-space invariant are fatal; conditions
//! that merely waste space are logged and tolerated. See [`crate::fatal`] for
//! the terminal path.

use core::fmt;

/// Recoverable error kinds returned by core entry points.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemError {
    /// A virtual address was non-canonical, or a large-page entry was in the
    /// way of a walk that expected to descend further.
    InvalidAddress,
    /// The physical frame allocator's bitmap has no free bits (or no run long
    /// enough for a contiguous request).
    NoFrame,
    /// A region's cursor would pass its limit.
    RegionExhausted,
    /// An argument violated a documented precondition (e.g. `sbrk` size not a
    /// page multiple).
    BadArgument,
    /// The operation is not implemented by design (MMIO mapping, `valloc` on
    /// an allocator that doesn't support it).
    Unsupported,
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemError::InvalidAddress => "invalid or non-canonical address",
            MemError::NoFrame => "no free physical frame",
            MemError::RegionExhausted => "region cursor would exceed its limit",
            MemError::BadArgument => "bad argument",
            MemError::Unsupported => "operation unsupported",
        };
        f.write_str(s)
    }
}

pub type MemResult<T> = Result<T, MemError>;
