//! One generation of allocations.
//!
//! An epoch owns a page arena, the region allocator drawing from it and any
//! oversized blocks that bypassed the region. All three live in whole pages,
//! so the epoch can move its entire footprint between read-write, read-only
//! and no-access with [`Epoch::protect`].

use std::ptr::NonNull;

use super::fatal::die;
use super::guard::{Guarded, Signed};
use super::page_arena::PageArena;
use super::pages::{PageBox, map_pages, protect_or_die, unmap_pages};
use super::region::Region;
use super::stats;
use super::vm::{Protection, VmError};
use crate::config::{ArenaFlags, ArenaOptions, ReleasePolicy};

/// A block that bypassed the region allocator. Page aligned, whole pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LargeBlock {
    addr: NonNull<u8>,
    size: usize,
}

// Safety: a LargeBlock is a description of pages owned by its epoch.
unsafe impl Send for LargeBlock {}

impl LargeBlock {
    #[inline]
    pub fn addr(&self) -> NonNull<u8> {
        self.addr
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

/// The storage behind an epoch. Only the arena/region pairing exists.
pub(crate) enum EpochBackend {
    // Field order is drop order: the region returns its slabs to the arena.
    Region {
        region: PageBox<Region>,
        arena: PageBox<PageArena>,
    },
}

#[repr(C)]
pub struct Epoch {
    signature: u64,
    backend: EpochBackend,
    oversized: Vec<LargeBlock>,
    memory_release: ReleasePolicy,
}

// Safety: repr(C) with the signature as the first field.
unsafe impl Signed for Epoch {
    const SIGNATURE: u64 = 0x4550_4f43_485f_5631;
    const NAME: &'static str = "Epoch";
}

impl Epoch {
    /// A fresh, fully writable epoch behind its own guard page.
    ///
    /// `objects` governs the epoch, arena and region objects; `memory` governs
    /// the slabs and oversized blocks.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the arena cannot be built or any page mapping
    /// fails.
    pub(crate) fn create(
        options: &ArenaOptions,
        objects: ReleasePolicy,
        memory: ReleasePolicy,
    ) -> Result<Guarded<Epoch>, VmError> {
        let arena = PageBox::new(PageArena::new(options, memory)?, objects)?;
        // Safety: the arena box's pages never move and outlive the region,
        // which is dropped first.
        let arena_ptr = unsafe { NonNull::new_unchecked(arena.as_ptr()) };
        let region = PageBox::new(Region::new(arena_ptr), objects)?;
        stats::LIVE_EPOCHS.add(1);
        let epoch = Epoch {
            signature: Self::SIGNATURE,
            backend: EpochBackend::Region { region, arena },
            oversized: Vec::new(),
            memory_release: memory,
        };
        Guarded::new(epoch, objects)
    }

    /// Abort unless this is a live epoch.
    pub(crate) fn validate(&self) {
        // Safety: reading our own first field.
        let signature = unsafe { std::ptr::read_volatile(&raw const self.signature) };
        if signature != Self::SIGNATURE {
            die!("epoch at {:p} failed validation (signature {signature:#018x})", self);
        }
    }

    #[inline]
    pub(crate) fn arena(&self) -> *mut PageArena {
        match &self.backend {
            EpochBackend::Region { arena, .. } => arena.as_ptr(),
        }
    }

    #[inline]
    pub(crate) fn region(&self) -> *mut Region {
        match &self.backend {
            EpochBackend::Region { region, .. } => region.as_ptr(),
        }
    }

    #[inline]
    pub fn oversized(&self) -> &[LargeBlock] {
        &self.oversized
    }

    pub fn oversized_bytes(&self) -> usize {
        self.oversized.iter().map(LargeBlock::size).sum()
    }

    /// Map `size` bytes outside the region and track them with this epoch.
    pub(crate) fn allocate_oversized(&mut self, size: usize) -> Option<NonNull<u8>> {
        match map_pages(size, ArenaFlags::Private) {
            Ok((addr, size)) => {
                self.oversized.push(LargeBlock { addr, size });
                stats::OVERSIZED_BYTES.add(size);
                tracing::trace!(addr = ?addr, size, "oversized block");
                Some(addr)
            }
            Err(e) => {
                tracing::warn!(error = %e, size, "oversized allocation failed");
                None
            }
        }
    }

    /// Move every page of this epoch to `mode`.
    ///
    /// Each header is made readable just long enough to walk what hangs off
    /// it, then receives `mode` itself.
    ///
    /// # Safety
    ///
    /// Lowering protection invalidates every pointer handed out from this
    /// epoch until it is raised again.
    pub(crate) unsafe fn protect(&self, mode: Protection) {
        match &self.backend {
            EpochBackend::Region { region, arena } => {
                // Safety: both boxes and all their slabs belong to this epoch.
                unsafe {
                    arena.protect(Protection::Read);
                    (*arena.as_ptr()).protect_slabs(mode);
                    arena.protect(mode);

                    region.protect(Protection::Read);
                    (*region.as_ptr()).protect_slabs(mode);
                    region.protect(mode);
                }
            }
        }
        for block in &self.oversized {
            // Safety: oversized blocks are whole pages owned by this epoch.
            unsafe { protect_or_die(block.addr, block.size, mode) };
        }
    }

    /// Hand every region slab back to the arena.
    ///
    /// # Safety
    ///
    /// The epoch must be read-write and no pointer into its region may be
    /// used afterwards.
    pub(crate) unsafe fn reclaim(&mut self) {
        // Safety: upheld by caller.
        unsafe { (*self.region()).gc(u64::MAX) };
    }

    /// Reset to a state fit to serve as the current epoch again.
    ///
    /// # Safety
    ///
    /// No pointer into this epoch may be used afterwards.
    pub(crate) unsafe fn recycle(&mut self) {
        // Safety: upheld by caller.
        unsafe {
            self.protect(Protection::ReadWrite);
            self.reclaim();
        }
        self.release_oversized();
    }

    fn release_oversized(&mut self) {
        for block in self.oversized.drain(..) {
            // Safety: each block was mapped by `allocate_oversized` and is
            // owned by this epoch alone.
            unsafe {
                protect_or_die(block.addr, block.size, Protection::ReadWrite);
                unmap_pages(block.addr, block.size, self.memory_release);
            }
            stats::sub_saturating(&stats::OVERSIZED_BYTES, block.size);
        }
    }

    /// Bytes allocated in the region plus oversized bytes.
    ///
    /// # Safety
    ///
    /// The region must be readable.
    pub(crate) unsafe fn used(&self) -> usize {
        // Safety: upheld by caller.
        unsafe { (*self.region()).used() + self.oversized_bytes() }
    }

    /// Bytes held by the region plus oversized bytes.
    ///
    /// # Safety
    ///
    /// The region must be readable.
    pub(crate) unsafe fn total(&self) -> usize {
        // Safety: upheld by caller.
        unsafe { (*self.region()).total() + self.oversized_bytes() }
    }
}

impl Drop for Epoch {
    fn drop(&mut self) {
        // Safety: the epoch is being destroyed; whatever protection it was
        // left in, teardown needs to write slab links.
        unsafe { self.protect(Protection::ReadWrite) };
        self.release_oversized();
        stats::sub_saturating(&stats::LIVE_EPOCHS, 1);
        tracing::trace!(epoch = ?std::ptr::from_ref(self), "epoch destroyed");
    }
}

impl std::fmt::Debug for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Epoch")
            .field("arena", &self.arena())
            .field("region", &self.region())
            .field("oversized", &self.oversized.len())
            .finish_non_exhaustive()
    }
}
