//! Slab source for one epoch's region allocator.
//!
//! Hands out fixed-size, page-aligned slabs under a byte quota. Returned
//! slabs are kept on an intrusive list (the link lives in the slab's first
//! word) and handed out again before anything new is mapped.

use std::ptr::{self, NonNull};

use super::pages::{self, map_pages, protect_or_die, unmap_pages};
use super::stats;
use super::vm::{Protection, VmError};
use crate::config::{ArenaFlags, ArenaOptions, ReleasePolicy};

/// Largest slab an arena will map.
pub const MAX_SLAB_SIZE: usize = 1 << 32;

pub struct PageArena {
    slab_size: usize,
    quota: usize,
    used: usize,
    flags: ArenaFlags,
    release: ReleasePolicy,
    cache: *mut u8,
    cached: usize,
}

// Safety: PageArena owns its slabs; the raw cache list is only reached
// through &mut self.
unsafe impl Send for PageArena {}

impl PageArena {
    /// # Errors
    ///
    /// `InvalidSlabSize` for a zero or oversized slab, `QuotaExceeded` if
    /// `prealloc` does not fit in `quota`, or any mapping failure while
    /// preallocating.
    pub fn new(options: &ArenaOptions, release: ReleasePolicy) -> Result<Self, VmError> {
        let slab_size = match pages::round_to_pages(options.slab_size) {
            Some(rounded) if options.slab_size != 0 && rounded <= MAX_SLAB_SIZE => rounded,
            _ => {
                return Err(VmError::InvalidSlabSize {
                    size: options.slab_size,
                    max: MAX_SLAB_SIZE,
                });
            }
        };
        if options.prealloc > options.quota {
            return Err(VmError::QuotaExceeded {
                requested: options.prealloc,
                used: 0,
                limit: options.quota,
            });
        }
        let mut arena = Self {
            slab_size,
            quota: options.quota,
            used: 0,
            flags: options.flags,
            release,
            cache: ptr::null_mut(),
            cached: 0,
        };
        for _ in 0..options.prealloc / arena.slab_size {
            let slab = arena.map_fresh()?;
            // Safety: the slab was just mapped by this arena.
            unsafe { arena.unmap_slab(slab) };
        }
        Ok(arena)
    }

    fn map_fresh(&mut self) -> Result<NonNull<u8>, VmError> {
        let next = self.used.saturating_add(self.slab_size);
        if next > self.quota {
            return Err(VmError::QuotaExceeded {
                requested: self.slab_size,
                used: self.used,
                limit: self.quota,
            });
        }
        let (slab, size) = map_pages(self.slab_size, self.flags)?;
        debug_assert_eq!(size, self.slab_size);
        self.used = next;
        stats::ARENA_SLAB_BYTES.add(size);
        tracing::trace!(slab = ?slab, size, used = self.used, "map slab");
        Ok(slab)
    }

    /// A read-write slab of [`slab_size`](Self::slab_size) bytes, or `None`
    /// when the quota is spent or the OS refuses.
    pub fn map_slab(&mut self) -> Option<NonNull<u8>> {
        if let Some(slab) = NonNull::new(self.cache) {
            // Safety: cached slabs are ours and read-write while the arena is.
            self.cache = unsafe { slab.cast::<*mut u8>().read() };
            self.cached -= 1;
            return Some(slab);
        }
        match self.map_fresh() {
            Ok(slab) => Some(slab),
            Err(e) => {
                tracing::warn!(error = %e, "page arena cannot supply a slab");
                None
            }
        }
    }

    /// Return a slab for reuse.
    ///
    /// # Safety
    ///
    /// `slab` must come from [`map_slab`](Self::map_slab) on this arena, be
    /// read-write, and not be used by the caller afterwards.
    pub unsafe fn unmap_slab(&mut self, slab: NonNull<u8>) {
        // Safety: caller hands the slab back; its first word becomes the link.
        unsafe { slab.cast::<*mut u8>().write(self.cache) };
        self.cache = slab.as_ptr();
        self.cached += 1;
    }

    /// Apply `mode` to every cached slab.
    ///
    /// Each slab's first page is made readable long enough to fetch the
    /// link, so the walk works from any starting protection.
    ///
    /// # Safety
    ///
    /// `self` must be readable for the duration of the call.
    pub unsafe fn protect_slabs(&self, mode: Protection) {
        let page = pages::page_size();
        let mut cursor = self.cache;
        while let Some(slab) = NonNull::new(cursor) {
            // Safety: cached slabs are owned by this arena and page aligned.
            unsafe {
                protect_or_die(slab, page, Protection::Read);
                cursor = slab.cast::<*mut u8>().read();
                protect_or_die(slab, self.slab_size, mode);
            }
        }
    }

    #[inline]
    pub fn slab_size(&self) -> usize {
        self.slab_size
    }

    #[inline]
    pub fn quota(&self) -> usize {
        self.quota
    }

    /// Bytes mapped by this arena, cached slabs included.
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn cached_slabs(&self) -> usize {
        self.cached
    }
}

impl Drop for PageArena {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.used,
            self.cached * self.slab_size,
            "page arena dropped with slabs still handed out"
        );
        let page = pages::page_size();
        let mut cursor = self.cache;
        while let Some(slab) = NonNull::new(cursor) {
            // Safety: we own every cached slab; nothing else references them.
            unsafe {
                protect_or_die(slab, page, Protection::Read);
                cursor = slab.cast::<*mut u8>().read();
                unmap_pages(slab, self.slab_size, self.release);
            }
            stats::sub_saturating(&stats::ARENA_SLAB_BYTES, self.slab_size);
        }
        self.cache = ptr::null_mut();
        self.cached = 0;
    }
}

impl std::fmt::Debug for PageArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageArena")
            .field("slab_size", &self.slab_size)
            .field("quota", &self.quota)
            .field("used", &self.used)
            .field("cached", &self.cached)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    fn options(quota: usize, prealloc: usize, slab_size: usize) -> ArenaOptions {
        ArenaOptions::new(quota, prealloc, slab_size, ArenaFlags::Private)
    }

    #[test]
    fn test_slab_size_rounded_to_pages() {
        let arena = PageArena::new(&options(usize::MAX, 0, 100), ReleasePolicy::Unmap).unwrap();
        assert_eq!(arena.slab_size(), pages::page_size());
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_rejects_zero_slab() {
        let err = PageArena::new(&options(usize::MAX, 0, 0), ReleasePolicy::Unmap).unwrap_err();
        assert!(matches!(err, VmError::InvalidSlabSize { size: 0, .. }));
    }

    #[test]
    fn test_rejects_prealloc_over_quota() {
        let err = PageArena::new(&options(4096, 8192, 4096), ReleasePolicy::Unmap).unwrap_err();
        assert!(matches!(err, VmError::QuotaExceeded { limit: 4096, .. }));
    }

    #[test]
    fn test_prealloc_fills_cache() {
        let page = pages::page_size();
        let mut arena =
            PageArena::new(&options(usize::MAX, page * 3, page), ReleasePolicy::Unmap).unwrap();
        assert_eq!(arena.cached_slabs(), 3);
        assert_eq!(arena.used(), page * 3);
        let slab = arena.map_slab().unwrap();
        assert_eq!(arena.cached_slabs(), 2);
        // no new mapping
        assert_eq!(arena.used(), page * 3);
        // Safety: Test code.
        unsafe { arena.unmap_slab(slab) };
    }

    #[test]
    fn test_cache_is_lifo() {
        let page = pages::page_size();
        let mut arena = PageArena::new(&options(usize::MAX, 0, page), ReleasePolicy::Unmap).unwrap();
        let a = arena.map_slab().unwrap();
        let b = arena.map_slab().unwrap();
        assert_ne!(a, b);
        // Safety: Test code.
        unsafe {
            arena.unmap_slab(a);
            arena.unmap_slab(b);
        }
        assert_eq!(arena.map_slab(), Some(b));
        assert_eq!(arena.map_slab(), Some(a));
        // Safety: Test code.
        unsafe {
            arena.unmap_slab(a);
            arena.unmap_slab(b);
        }
    }

    #[test]
    fn test_quota_limits_fresh_slabs() {
        let page = pages::page_size();
        let mut arena =
            PageArena::new(&options(page * 2, 0, page), ReleasePolicy::Unmap).unwrap();
        let a = arena.map_slab().unwrap();
        let b = arena.map_slab().unwrap();
        assert!(arena.map_slab().is_none());
        // Safety: Test code.
        unsafe { arena.unmap_slab(a) };
        // a cached slab does not count against the quota twice
        assert_eq!(arena.map_slab(), Some(a));
        // Safety: Test code.
        unsafe {
            arena.unmap_slab(a);
            arena.unmap_slab(b);
        }
    }

    #[test]
    fn test_protect_slabs_walks_from_none() {
        let page = pages::page_size();
        let mut arena =
            PageArena::new(&options(usize::MAX, page * 2, page), ReleasePolicy::Unmap).unwrap();
        // Safety: Test code.
        unsafe {
            arena.protect_slabs(Protection::None);
            arena.protect_slabs(Protection::Read);
            arena.protect_slabs(Protection::ReadWrite);
        }
        let slab = arena.map_slab().unwrap();
        // Safety: Test code, slab is read-write again.
        unsafe {
            *slab.as_ptr().add(page - 1) = 1;
            arena.unmap_slab(slab);
        }
    }

    #[test]
    fn test_drop_retains_cached_slabs() {
        let page = pages::page_size();
        let before = stats::RETAINED_BYTES.get();
        {
            let _arena =
                PageArena::new(&options(usize::MAX, page * 4, page), ReleasePolicy::Retain).unwrap();
        }
        assert!(stats::RETAINED_BYTES.get() >= before + page * 4);
    }
}
