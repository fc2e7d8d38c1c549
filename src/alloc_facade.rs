//! The generic allocator facade: `malloc`/`realloc`/`calloc`/`valloc`/`free`
//! dispatched to a pluggable backing allocator, with optional single-shot
//! profiling.
//!
//! Every forwarder updates the profiling counters *before* delegating to the
//! backing allocator, so a panic inside the backing allocator still leaves
//! accurate request counts — this ordering, and the `calloc` byte count being
//! `elements * size` rather than a re-queried post-allocation size, both
//! match the forwarder in `alloc.c` exactly.

use core::ffi::c_void;

use log::warn;
use spin::Mutex;

/// What a backing allocator is willing to do, queried once and cached.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Capabilities {
    pub name: &'static str,
    pub version: u32,
    pub supports_valloc: bool,
    pub supports_profile: bool,
}

/// A pluggable heap allocator the facade forwards to.
///
/// # Safety
///
/// Implementations must uphold the usual `GlobalAlloc`-style contract: a
/// pointer returned by `malloc`/`realloc`/`calloc`/`valloc` remains valid
/// until passed to `free`, and `realloc`/`free` must only ever be given
/// pointers this allocator itself produced.
pub unsafe trait BackingAllocator {
    fn capabilities(&self) -> Capabilities;

    fn malloc(&self, size: usize) -> *mut c_void;
    /// # Safety
    /// `ptr` must be null or a pointer this allocator returned and not yet freed.
    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void;
    /// # Safety
    /// `ptr` must be null or a pointer this allocator returned and not yet freed.
    unsafe fn free(&self, ptr: *mut c_void);
    /// Page-aligned allocation. `None` if [`Capabilities::supports_valloc`] is false.
    fn valloc(&self, size: usize) -> Option<*mut c_void>;
}

/// Error codes returned where the original used negative `errno` values.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FacadeError {
    /// `-ENOTSUP`
    NotSupported,
    /// `-EINPROGRESS`
    AlreadyProfiling,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ProfileSnapshot {
    pub requests: u64,
    pub bytes_allocated: u64,
    pub most_bytes_allocated: u64,
    pub least_bytes_allocated: u64,
    pub time_start: u64,
    pub time_end: u64,
}

struct ProfileState {
    active: bool,
    snapshot: ProfileSnapshot,
}

/// Generic allocator facade over a single backing allocator `A`.
pub struct Facade<A: BackingAllocator> {
    backing: A,
    capabilities: Mutex<Option<Capabilities>>,
    profile: Mutex<ProfileState>,
}

impl<A: BackingAllocator> Facade<A> {
    pub const fn new(backing: A) -> Facade<A> {
        Facade {
            backing,
            capabilities: Mutex::new(None),
            profile: Mutex::new(ProfileState {
                active: false,
                snapshot: ProfileSnapshot {
                    requests: 0,
                    bytes_allocated: 0,
                    most_bytes_allocated: 0,
                    least_bytes_allocated: 0,
                    time_start: 0,
                    time_end: 0,
                },
            }),
        }
    }

    /// Memoized capability descriptor, mirroring `alloc_canHasValloc`'s
    /// cached `alloc_info`.
    pub fn capabilities(&self) -> Capabilities {
        let mut cached = self.capabilities.lock();
        if let Some(c) = *cached {
            return c;
        }
        let c = self.backing.capabilities();
        *cached = Some(c);
        c
    }

    fn record_request(&self, bytes: usize) {
        let mut profile = self.profile.lock();
        if !profile.active {
            return;
        }
        let bytes = bytes as u64;
        profile.snapshot.requests += 1;
        profile.snapshot.bytes_allocated += bytes;
        if bytes > profile.snapshot.most_bytes_allocated {
            profile.snapshot.most_bytes_allocated = bytes;
        }
        if bytes < profile.snapshot.least_bytes_allocated {
            profile.snapshot.least_bytes_allocated = bytes;
        }
    }

    /// `free` has no size to report, so it only bumps the request count,
    /// matching the original's `kfree`, which never touched the byte
    /// counters.
    fn record_free_request(&self) {
        let mut profile = self.profile.lock();
        if !profile.active {
            return;
        }
        profile.snapshot.requests += 1;
    }

    pub fn malloc(&self, size: usize) -> *mut c_void {
        self.record_request(size);
        self.backing.malloc(size)
    }

    /// # Safety
    /// `ptr` must be null or a pointer previously returned by this facade and
    /// not yet freed.
    pub unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        self.record_request(size);
        unsafe { self.backing.realloc(ptr, size) }
    }

    pub fn calloc(&self, elements: usize, size: usize) -> *mut c_void {
        // Recorded pre-multiplication, matching the original's forwarder
        // exactly, not the actual post-allocation size.
        self.record_request(elements.saturating_mul(size));
        let ptr = self.backing.malloc(elements.saturating_mul(size));
        if !ptr.is_null() {
            unsafe {
                core::ptr::write_bytes(ptr as *mut u8, 0, elements.saturating_mul(size));
            }
        }
        ptr
    }

    pub fn valloc(&self, size: usize) -> Result<*mut c_void, FacadeError> {
        if !self.capabilities().supports_valloc {
            return Err(FacadeError::NotSupported);
        }
        self.record_request(size);
        self.backing.valloc(size).ok_or(FacadeError::NotSupported)
    }

    /// # Safety
    /// `ptr` must be null or a pointer previously returned by this facade and
    /// not yet freed.
    pub unsafe fn free(&self, ptr: *mut c_void) {
        self.record_free_request();
        unsafe { self.backing.free(ptr) }
    }

    /// Starts profiling. `force` is accepted for interface parity with the
    /// original's `alloc_startProfiling(force_begin_profiling)`, but — like
    /// the original, which never implemented the force path past logging —
    /// it has no effect here beyond that log line.
    pub fn start_profiling(&self, force: bool, now: u64) -> Result<(), FacadeError> {
        if !self.capabilities().supports_profile {
            return Err(FacadeError::NotSupported);
        }

        let mut profile = self.profile.lock();
        if profile.active {
            return Err(FacadeError::AlreadyProfiling);
        }

        if force {
            warn!("alloc_facade: force-start profiling requested but not implemented");
        }

        profile.active = true;
        profile.snapshot = ProfileSnapshot {
            requests: 0,
            bytes_allocated: 0,
            most_bytes_allocated: 0,
            least_bytes_allocated: u64::MAX,
            time_start: now,
            time_end: 0,
        };
        Ok(())
    }

    /// Stops profiling and returns the final snapshot, or `None` if
    /// profiling was never started.
    pub fn stop_profiling(&self, now: u64) -> Option<ProfileSnapshot> {
        let mut profile = self.profile.lock();
        if !profile.active {
            return None;
        }
        profile.active = false;
        profile.snapshot.time_end = now;
        Some(profile.snapshot)
    }
}

// SAFETY: `Facade` only ever touches `backing` through its `&self` methods,
// which `BackingAllocator` requires to already be internally synchronized.
unsafe impl<A: BackingAllocator + Sync> Sync for Facade<A> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FakeBacking {
        next: StdMutex<usize>,
        caps: Capabilities,
    }

    unsafe impl BackingAllocator for FakeBacking {
        fn capabilities(&self) -> Capabilities {
            self.caps
        }

        fn malloc(&self, size: usize) -> *mut c_void {
            let mut next = self.next.lock().unwrap();
            *next += size.max(1);
            *next as *mut c_void
        }

        unsafe fn realloc(&self, _ptr: *mut c_void, size: usize) -> *mut c_void {
            self.malloc(size)
        }

        unsafe fn free(&self, _ptr: *mut c_void) {}

        fn valloc(&self, size: usize) -> Option<*mut c_void> {
            if self.caps.supports_valloc {
                Some(self.malloc(size))
            } else {
                None
            }
        }
    }

    fn facade(supports_valloc: bool, supports_profile: bool) -> Facade<FakeBacking> {
        Facade::new(FakeBacking {
            next: StdMutex::new(0),
            caps: Capabilities {
                name: "fake",
                version: 1,
                supports_valloc,
                supports_profile,
            },
        })
    }

    #[test]
    fn valloc_reports_not_supported_when_backing_lacks_it() {
        let f = facade(false, true);
        assert_eq!(f.valloc(4096), Err(FacadeError::NotSupported));
    }

    #[test]
    fn valloc_succeeds_when_backing_supports_it() {
        let f = facade(true, true);
        assert!(f.valloc(4096).is_ok());
    }

    #[test]
    fn profiling_rejects_double_start() {
        let f = facade(true, true);
        assert!(f.start_profiling(false, 0).is_ok());
        assert_eq!(
            f.start_profiling(false, 1),
            Err(FacadeError::AlreadyProfiling)
        );
    }

    #[test]
    fn profiling_unsupported_is_rejected() {
        let f = facade(true, false);
        assert_eq!(
            f.start_profiling(false, 0),
            Err(FacadeError::NotSupported)
        );
    }

    #[test]
    fn stop_without_start_returns_none() {
        let f = facade(true, true);
        assert!(f.stop_profiling(5).is_none());
    }

    #[test]
    fn profiling_tracks_request_counts_and_extremes() {
        let f = facade(true, true);
        f.start_profiling(false, 0).unwrap();

        f.malloc(16);
        f.malloc(256);
        f.malloc(8);

        let snap = f.stop_profiling(100).unwrap();
        assert_eq!(snap.requests, 3);
        assert_eq!(snap.bytes_allocated, 16 + 256 + 8);
        assert_eq!(snap.most_bytes_allocated, 256);
        assert_eq!(snap.least_bytes_allocated, 8);
        assert_eq!(snap.time_start, 0);
        assert_eq!(snap.time_end, 100);
    }

    #[test]
    fn calloc_records_pre_multiplication_size() {
        let f = facade(true, true);
        f.start_profiling(false, 0).unwrap();
        f.calloc(4, 32);
        let snap = f.stop_profiling(1).unwrap();
        assert_eq!(snap.bytes_allocated, 128);
    }

    #[test]
    fn capabilities_are_cached_after_first_call() {
        let f = facade(true, true);
        let first = f.capabilities();
        let second = f.capabilities();
        assert_eq!(first, second);
    }

    #[test]
    fn free_bumps_request_count_without_touching_byte_counters() {
        let f = facade(true, true);
        f.start_profiling(false, 0).unwrap();

        let ptr = f.malloc(16);
        unsafe { f.free(ptr) };

        let snap = f.stop_profiling(1).unwrap();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.bytes_allocated, 16);
    }
}
