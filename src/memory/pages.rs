//! Page-granular allocation and protection.
//!
//! Everything this layer protects lives in whole pages obtained here, so a
//! single `mprotect` covers an object exactly and never touches a neighbour.
//! Protection failures are not recoverable: see [`protect_or_die`].

use std::marker::PhantomData;
use std::ptr::NonNull;

use super::fatal::die;
use super::stats;
use super::vm::{PlatformVmOps, Protection, VmError, VmOps};
use crate::config::{ArenaFlags, ReleasePolicy};

#[inline]
pub(crate) fn page_size() -> usize {
    PlatformVmOps::page_size()
}

/// Whole pages covering `size` (at least one), or `None` past the address space.
#[inline]
pub(crate) fn round_to_pages(size: usize) -> Option<usize> {
    size.max(1).checked_next_multiple_of(page_size())
}

#[inline]
pub(crate) fn is_page_aligned(value: usize) -> bool {
    value.is_multiple_of(page_size())
}

/// Map `size` bytes (rounded up to whole pages) readable and writable.
///
/// # Errors
///
/// Returns `VmError` if `size` cannot be rounded to pages or the OS refuses
/// the mapping.
pub(crate) fn map_pages(size: usize, flags: ArenaFlags) -> Result<(NonNull<u8>, usize), VmError> {
    let size = round_to_pages(size).ok_or_else(|| {
        VmError::ReservationFailed(std::io::Error::new(
            std::io::ErrorKind::OutOfMemory,
            format!("{size} bytes do not fit in whole pages"),
        ))
    })?;
    // Safety: FFI calls to reserve and commit a fresh range.
    unsafe {
        let ptr = PlatformVmOps::reserve(size, flags)?;
        if let Err(e) = PlatformVmOps::commit(ptr, size) {
            drop(PlatformVmOps::release(ptr, size));
            return Err(e);
        }
        stats::MAPPED_BYTES.add(size);
        Ok((ptr, size))
    }
}

/// Give pages obtained from [`map_pages`] back according to `release`.
///
/// Under [`ReleasePolicy::Retain`] the range stays mapped with no access for
/// the rest of the process, so a stale pointer into it keeps trapping.
///
/// # Safety
///
/// `ptr`/`size` must describe exactly one range returned by [`map_pages`]
/// that has not been unmapped yet, and nothing may access it afterwards.
pub(crate) unsafe fn unmap_pages(ptr: NonNull<u8>, size: usize, release: ReleasePolicy) {
    check_span(ptr, size);
    stats::sub_saturating(&stats::MAPPED_BYTES, size);
    match release {
        ReleasePolicy::Unmap => {
            // Safety: caller guarantees the range is ours and unused.
            if let Err(e) = unsafe { PlatformVmOps::release(ptr, size) } {
                die!("munmap of {ptr:p} ({size} bytes) failed: {e}");
            }
        }
        ReleasePolicy::Retain => {
            // Shared mappings reject MADV_FREE; fall back to a plain PROT_NONE.
            // Safety: caller guarantees the range is ours and unused.
            if unsafe { PlatformVmOps::decommit(ptr, size) }.is_err() {
                // Safety: same range as above.
                unsafe { protect_or_die(ptr, size, Protection::None) };
            }
            stats::RETAINED_BYTES.add(size);
        }
    }
}

/// Change the protection of a page-aligned range, aborting on failure.
///
/// # Safety
///
/// The range must be mapped by this process and owned by the caller; lowering
/// protection under live references held elsewhere is the caller's business
/// (that is how stale accesses are detected).
pub(crate) unsafe fn protect_or_die(ptr: NonNull<u8>, size: usize, protection: Protection) {
    if size == 0 {
        return;
    }
    check_span(ptr, size);
    stats::PROTECT_CALLS.add(1);
    tracing::trace!(addr = ?ptr, size, ?protection, "protect");
    // Safety: alignment checked above, ownership upheld by caller.
    if let Err(e) = unsafe { PlatformVmOps::protect(ptr, size, protection) } {
        die!("mprotect({ptr:p}, {size}, {protection:?}) failed: {e}");
    }
}

fn check_span(ptr: NonNull<u8>, size: usize) {
    let addr = ptr.as_ptr() as usize;
    if !is_page_aligned(addr) || !is_page_aligned(size) {
        die!(
            "misaligned page span {ptr:p} + {size} (page size {})",
            page_size()
        );
    }
}

/// An owned `T` placed at the start of its own whole pages.
///
/// The value is never reachable through a safe reference: its pages may be
/// read-only or inaccessible at any time, so every access goes through a raw
/// pointer under a documented protection state.
pub(crate) struct PageBox<T> {
    ptr: NonNull<T>,
    mapped: usize,
    release: ReleasePolicy,
    _owns: PhantomData<T>,
}

// Safety: PageBox owns its pages exclusively; sending it moves that ownership.
unsafe impl<T: Send> Send for PageBox<T> {}

impl<T> PageBox<T> {
    /// # Errors
    ///
    /// Returns `VmError` if the pages cannot be mapped.
    pub(crate) fn new(value: T, release: ReleasePolicy) -> Result<Self, VmError> {
        debug_assert!(std::mem::align_of::<T>() <= page_size());
        let (base, mapped) = map_pages(std::mem::size_of::<T>(), ArenaFlags::Private)?;
        let ptr = base.cast::<T>();
        // Safety: fresh read-write mapping, page aligned, large enough for T.
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self {
            ptr,
            mapped,
            release,
            _owns: PhantomData,
        })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Start and length of the pages holding the value.
    #[inline]
    pub(crate) fn span(&self) -> (NonNull<u8>, usize) {
        (self.ptr.cast::<u8>(), self.mapped)
    }

    /// # Safety
    ///
    /// See [`protect_or_die`].
    pub(crate) unsafe fn protect(&self, protection: Protection) {
        let (base, len) = self.span();
        // Safety: upheld by caller.
        unsafe { protect_or_die(base, len, protection) };
    }
}

impl<T> Drop for PageBox<T> {
    fn drop(&mut self) {
        // Safety: we own the pages; they must be writable for T's destructor.
        unsafe {
            self.protect(Protection::ReadWrite);
            std::ptr::drop_in_place(self.ptr.as_ptr());
            unmap_pages(self.ptr.cast::<u8>(), self.mapped, self.release);
        }
    }
}

/// Protection the kernel reports for the mapping holding `addr`, read from
/// `/proc/self/maps`.
#[cfg(all(test, target_os = "linux", not(any(loom, miri))))]
pub(crate) fn mapped_protection(addr: usize) -> Option<Protection> {
    let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
    maps.lines().find_map(|line| {
        let (range, rest) = line.split_once(' ')?;
        let (start, end) = range.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        if !(start..end).contains(&addr) {
            return None;
        }
        Some(match rest.get(..2)? {
            "rw" => Protection::ReadWrite,
            "r-" => Protection::Read,
            _ => Protection::None,
        })
    })
}
