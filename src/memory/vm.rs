use std::ptr::NonNull;

use thiserror::Error;

use crate::config::ArenaFlags;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("could not map {0}")]
    ReservationFailed(#[source] std::io::Error),
    #[error("could not make pages accessible: {0}")]
    CommitFailed(#[source] std::io::Error),
    #[error("could not drop page contents: {0}")]
    DecommitFailed(#[source] std::io::Error),
    #[error("could not unmap pages: {0}")]
    ReleaseFailed(#[source] std::io::Error),
    #[error("could not change page protection: {0}")]
    ProtectFailed(#[source] std::io::Error),
    #[error("quota exceeded: {requested} bytes requested, {used} of {limit} in use")]
    QuotaExceeded {
        requested: usize,
        used: usize,
        limit: usize,
    },
    #[error("invalid slab size {size}: must be non-zero and at most {max}")]
    InvalidSlabSize { size: usize, max: usize },
}

/// Page access rights.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protection {
    None,
    Read,
    ReadWrite,
}

/// Page-granular mapping primitives.
///
/// Every pointer and size handed in must be page aligned and lie inside a
/// range returned by `reserve`.
pub(crate) trait VmOps {
    /// Map `size` bytes with no access.
    unsafe fn reserve(size: usize, flags: ArenaFlags) -> Result<NonNull<u8>, VmError>;

    /// Open a reserved range for reading and writing.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Let the OS take the backing pages back; the range stays mapped and
    /// traps on access.
    unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Unmap the range.
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    unsafe fn protect(ptr: NonNull<u8>, size: usize, protection: Protection) -> Result<(), VmError>;

    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use std::io;

    use libc::{c_int, c_void};

    use super::{ArenaFlags, NonNull, PlatformVmOps, Protection, VmError, VmOps};

    fn prot(protection: Protection) -> c_int {
        match protection {
            Protection::None => libc::PROT_NONE,
            Protection::Read => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }

    /// Map a libc `0 on success` return to `Result`, capturing errno.
    fn check(ret: c_int, wrap: fn(io::Error) -> VmError) -> Result<(), VmError> {
        if ret == 0 {
            Ok(())
        } else {
            Err(wrap(io::Error::last_os_error()))
        }
    }

    fn addr(ptr: NonNull<u8>) -> *mut c_void {
        ptr.as_ptr().cast()
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize, flags: ArenaFlags) -> Result<NonNull<u8>, VmError> {
            let visibility = match flags {
                ArenaFlags::Private => libc::MAP_PRIVATE,
                ArenaFlags::Shared => libc::MAP_SHARED,
            };
            // Safety: anonymous mapping at a kernel-chosen address.
            let mapped = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    visibility | libc::MAP_ANON,
                    -1,
                    0,
                )
            };
            if mapped == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }
            NonNull::new(mapped.cast()).ok_or_else(|| {
                VmError::ReservationFailed(io::Error::other("mmap gave a null mapping"))
            })
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: caller passes a range inside a live mapping.
            let ret = unsafe { libc::mprotect(addr(ptr), size, prot(Protection::ReadWrite)) };
            check(ret, VmError::CommitFailed)
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // MADV_FREE is lazy, so old contents can reappear after a later
            // commit. Nothing reads a slab before writing it.
            // Safety: caller passes a range inside a live mapping.
            let ret = unsafe { libc::madvise(addr(ptr), size, libc::MADV_FREE) };
            check(ret, VmError::DecommitFailed)?;
            // Safety: as above.
            let ret = unsafe { libc::mprotect(addr(ptr), size, libc::PROT_NONE) };
            check(ret, VmError::DecommitFailed)
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: caller owns the whole range.
            let ret = unsafe { libc::munmap(addr(ptr), size) };
            check(ret, VmError::ReleaseFailed)
        }

        unsafe fn protect(ptr: NonNull<u8>, size: usize, protection: Protection) -> Result<(), VmError> {
            // Safety: caller passes a range inside a live mapping.
            let ret = unsafe { libc::mprotect(addr(ptr), size, prot(protection)) };
            check(ret, VmError::ProtectFailed)
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static PAGE: OnceLock<usize> = OnceLock::new();
            *PAGE.get_or_init(|| {
                // Safety: sysconf has no preconditions.
                let queried = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                match usize::try_from(queried) {
                    Ok(size) if size > 0 => size,
                    _ => {
                        let err = io::Error::last_os_error();
                        crate::memory::fatal::die!("cannot query the page size: {err}")
                    }
                }
            })
        }
    }
}

// Under loom and Miri there are no real mappings: each reservation is a
// zeroed heap block and protection changes do nothing. Nothing faults, so
// these builds check locking and pointer arithmetic only.
#[cfg(any(loom, miri))]
mod heap {
    use std::alloc::Layout;
    use std::io;

    use super::{ArenaFlags, NonNull, PlatformVmOps, Protection, VmError, VmOps};

    const PAGE: usize = 4096;

    fn layout(size: usize) -> Result<Layout, io::Error> {
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty mapping"));
        }
        Layout::from_size_align(size, PAGE).map_err(io::Error::other)
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize, _flags: ArenaFlags) -> Result<NonNull<u8>, VmError> {
            let layout = layout(size).map_err(VmError::ReservationFailed)?;
            // Safety: the layout is non-empty.
            let block = unsafe { std::alloc::alloc_zeroed(layout) };
            NonNull::new(block).ok_or_else(|| {
                VmError::ReservationFailed(io::Error::from(io::ErrorKind::OutOfMemory))
            })
        }

        unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            Ok(())
        }

        unsafe fn decommit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            let layout = layout(size).map_err(VmError::ReleaseFailed)?;
            // Safety: `ptr` came from `reserve` with this same size.
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
            Ok(())
        }

        unsafe fn protect(_ptr: NonNull<u8>, _size: usize, _protection: Protection) -> Result<(), VmError> {
            Ok(())
        }

        fn page_size() -> usize {
            PAGE
        }
    }
}
