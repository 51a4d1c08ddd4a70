//! Platform page-mapping layer.
//!
//! Two tiers: the raw [`VmOps`] trait (reserve address space, commit pages
//! into it, release it) and the abort-on-failure helpers the allocator
//! actually calls. Mapping failures are not recoverable for the enclosing
//! runtime — the helpers print a diagnostic naming the requesting subsystem
//! and abort the process.

use std::io;
use std::ptr::NonNull;

/// Abstract interface for virtual memory operations.
pub(crate) trait VmOps {
    /// Reserve address space without committing physical pages.
    /// The reservation is inaccessible until committed.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, io::Error>;

    /// Commit (make read-write) a range within a reservation. Freshly
    /// committed pages read as zero; recommitting an already-committed
    /// range is harmless and does not disturb its contents.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), io::Error>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), io::Error>;

    /// OS page size. Constant for the process lifetime, power of two.
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmOps};
    use std::io;

    // MAP_NORESERVE: reservations are sized in terabytes and must not
    // count against overcommit; pages gain backing on commit. Not every
    // unix spells it (macOS reservations behave that way by default).
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    const MAP_NORESERVE: libc::c_int = 0;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, io::Error> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON | MAP_NORESERVE,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(io::Error::other("mmap returned null")),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), io::Error> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), io::Error> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // This crate supports only 64-bit targets; the page size
                // fits in usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed VmOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler. Instead we back every
// "reservation" with a plain heap allocation. `commit` is an intentional
// no-op: the memory is accessible (and zeroed) from the moment it is
// reserved. This is sufficient for testing the *synchronization* logic of
// the allocators; page-fault behaviour is covered by the real
// implementation in normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, io::Error> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-size reservation",
            ));
        }
        let layout =
            std::alloc::Layout::from_size_align(size, 4096).map_err(io::Error::other)?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            io::Error::new(io::ErrorKind::OutOfMemory, "alloc returned null")
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), io::Error> {
        Ok(()) // heap memory is always accessible
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), io::Error> {
        let layout =
            std::alloc::Layout::from_size_align(size, 4096).map_err(io::Error::other)?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

// ---------------------------------------------------------------------------
// Abort-on-failure helpers
// ---------------------------------------------------------------------------

fn die(tag: &str, op: &str, size: usize, err: io::Error) -> ! {
    eprintln!("[shadowheap] {tag}: {op} of {size} bytes failed: {err}");
    std::process::abort();
}

/// OS page size, cached.
#[inline]
pub(crate) fn page_size() -> usize {
    PlatformVmOps::page_size()
}

/// Reserve `size` bytes of inaccessible address space. Aborts on failure.
/// `tag` names the requesting subsystem in the abort diagnostic.
pub(crate) fn reserve_range(size: usize, tag: &str) -> NonNull<u8> {
    // Safety: a fresh reservation has no aliasing constraints.
    match unsafe { PlatformVmOps::reserve(size) } {
        Ok(p) => p,
        Err(e) => die(tag, "reserve", size, e),
    }
}

/// Commit `size` bytes within a reservation. Aborts on failure.
///
/// # Safety
/// `[ptr, ptr + size)` must lie within a live reservation.
pub(crate) unsafe fn commit_range(ptr: NonNull<u8>, size: usize, tag: &str) {
    // Safety: upheld by caller.
    if let Err(e) = unsafe { PlatformVmOps::commit(ptr, size) } {
        die(tag, "commit", size, e);
    }
}

/// Map `size` bytes of fresh, zero-filled, page-aligned, read-write memory.
/// Aborts on failure.
pub(crate) fn map_pages(size: usize, tag: &str) -> NonNull<u8> {
    let ptr = reserve_range(size, tag);
    // Safety: the range was just reserved.
    unsafe { commit_range(ptr, size, tag) };
    ptr
}

/// Release a mapping obtained from `map_pages`/`reserve_range`. Aborts on
/// failure.
///
/// # Safety
/// `ptr`/`size` must exactly describe a live mapping, and nothing may touch
/// it afterwards.
pub(crate) unsafe fn unmap_pages(ptr: NonNull<u8>, size: usize) {
    // Safety: upheld by caller.
    if let Err(e) = unsafe { PlatformVmOps::release(ptr, size) } {
        die("vm", "unmap", size, e);
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = page_size();
        assert!(size >= 4096);
        assert!(size.is_power_of_two(), "page size {size} is not a power of two");
    }

    #[test]
    fn test_reserve_commit_release() {
        let size = page_size();
        let ptr = reserve_range(size, "test");
        // Safety: fresh reservation; committed before the writes.
        unsafe {
            commit_range(ptr, size, "test");
            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            slice[size - 1] = 24;
            assert_eq!(slice[0], 42);
            assert_eq!(slice[size - 1], 24);
            unmap_pages(ptr, size);
        }
    }

    #[test]
    fn test_map_pages_zero_filled() {
        let size = page_size() * 2;
        let ptr = map_pages(size, "test");
        // Safety: mapping is committed and `size` bytes long.
        unsafe {
            let slice = std::slice::from_raw_parts(ptr.as_ptr(), size);
            assert!(slice.iter().all(|&b| b == 0), "fresh mapping is not zeroed");
            unmap_pages(ptr, size);
        }
    }

    #[test]
    fn test_map_pages_page_aligned() {
        let ptr = map_pages(page_size(), "test");
        assert!((ptr.as_ptr() as usize).is_multiple_of(page_size()));
        // Safety: exact live mapping.
        unsafe { unmap_pages(ptr, page_size()) };
    }

    #[test]
    fn test_partial_commit() {
        let page = page_size();
        let total = page * 4;
        let ptr = reserve_range(total, "test");
        // Safety: the middle pages lie within the reservation.
        unsafe {
            let middle = NonNull::new(ptr.as_ptr().add(page)).unwrap();
            commit_range(middle, page * 2, "test");
            let slice = std::slice::from_raw_parts_mut(middle.as_ptr(), page * 2);
            slice[0] = 10;
            slice[page * 2 - 1] = 20;
            assert_eq!(slice[0], 10);
            assert_eq!(slice[page * 2 - 1], 20);
            unmap_pages(ptr, total);
        }
    }

    #[test]
    fn test_multiple_reservations_are_distinct() {
        let page = page_size();
        let a = map_pages(page, "test");
        let b = map_pages(page, "test");
        assert_ne!(a, b);
        // Safety: test mappings.
        unsafe {
            *a.as_ptr() = 1;
            *b.as_ptr() = 2;
            assert_eq!(*a.as_ptr(), 1);
            assert_eq!(*b.as_ptr(), 2);
            unmap_pages(a, page);
            unmap_pages(b, page);
        }
    }

    #[test]
    fn test_large_noreserve_reservation() {
        // A terabyte-scale PROT_NONE reservation must succeed without
        // touching physical memory.
        let size = 1usize << 40;
        let ptr = reserve_range(size, "test");
        // Safety: exact live reservation.
        unsafe { unmap_pages(ptr, size) };
    }
}
