//! Log-structured region allocator.
//!
//! Allocations bump forward through slabs taken from a [`PageArena`]. Each
//! slab remembers the highest allocation id it holds, and [`Region::gc`]
//! hands back whole slabs, oldest first, once the caller's watermark has
//! passed them. Nothing is ever freed individually.

use std::ptr::{self, NonNull};

use super::page_arena::PageArena;
use super::pages::{self, protect_or_die};
use super::vm::Protection;

#[repr(C)]
struct SlabHeader {
    next: *mut SlabHeader,
    size: usize,
    used: usize,
    max_id: u64,
}

const HEADER: usize = std::mem::size_of::<SlabHeader>();

impl SlabHeader {
    /// # Safety
    ///
    /// `slab` must be a read-write slab of `size` bytes owned by the caller.
    unsafe fn init(slab: NonNull<u8>, size: usize) -> *mut SlabHeader {
        let header = slab.cast::<SlabHeader>().as_ptr();
        // Safety: upheld by caller.
        unsafe {
            header.write(SlabHeader {
                next: ptr::null_mut(),
                size,
                used: HEADER,
                max_id: 0,
            });
        }
        header
    }

    /// Address where `size` bytes aligned to `align` would land, if they fit.
    fn fit(&self, size: usize, align: usize) -> Option<usize> {
        let base = ptr::from_ref(self) as usize;
        let start = (base + self.used).checked_next_multiple_of(align)?;
        let end = start.checked_add(size)?;
        (end <= base + self.size).then_some(start)
    }
}

pub struct Region {
    arena: NonNull<PageArena>,
    head: *mut SlabHeader,
    tail: *mut SlabHeader,
    cached: *mut SlabHeader,
    used: usize,
    total: usize,
}

// Safety: Region exclusively owns its slabs; the arena pointer refers to the
// arena owned by the same epoch, which always outlives the region.
unsafe impl Send for Region {}

impl Region {
    /// A region drawing slabs from `arena`.
    ///
    /// The arena must outlive the region and must not be moved while the
    /// region exists.
    pub fn new(arena: NonNull<PageArena>) -> Self {
        Self {
            arena,
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            cached: ptr::null_mut(),
            used: 0,
            total: 0,
        }
    }

    fn slab_size(&self) -> usize {
        // Safety: the arena outlives the region and is readable whenever the
        // region is.
        unsafe { self.arena.as_ref() }.slab_size()
    }

    /// Largest request with alignment `align` a single slab can serve.
    pub fn max_payload(&self, align: usize) -> usize {
        self.slab_size().saturating_sub(HEADER.next_multiple_of(align.max(1)))
    }

    fn grow(&mut self) -> Option<*mut SlabHeader> {
        let size = self.slab_size();
        let slab = match NonNull::new(self.cached) {
            Some(cached) => {
                self.cached = ptr::null_mut();
                cached.cast::<u8>()
            }
            // Safety: the arena outlives the region.
            None => unsafe { self.arena.as_mut() }.map_slab()?,
        };
        // Safety: the slab is read-write and now owned by this region.
        let header = unsafe { SlabHeader::init(slab, size) };
        if let Some(tail) = NonNull::new(self.tail) {
            // Safety: tail is a live slab of this region.
            unsafe { (*tail.as_ptr()).next = header };
        } else {
            self.head = header;
        }
        self.tail = header;
        self.total += size;
        Some(header)
    }

    /// Where an allocation of `size` bytes aligned to `align` would land,
    /// without committing it. May take a new slab.
    pub fn aligned_reserve(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if !align.is_power_of_two() || size > self.max_payload(align) {
            return None;
        }
        if let Some(tail) = NonNull::new(self.tail) {
            // Safety: tail is a live slab of this region.
            if let Some(addr) = unsafe { tail.as_ref() }.fit(size, align) {
                return NonNull::new(addr as *mut u8);
            }
        }
        let header = self.grow()?;
        // Safety: freshly initialised slab.
        let addr = unsafe { &*header }.fit(size, align)?;
        NonNull::new(addr as *mut u8)
    }

    #[inline]
    pub fn reserve(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.aligned_reserve(size, 1)
    }

    /// Commit `size` bytes aligned to `align`, tagged with allocation `id`.
    pub fn aligned_alloc(&mut self, size: usize, align: usize, id: u64) -> Option<NonNull<u8>> {
        let ptr = self.aligned_reserve(size, align)?;
        // Safety: reserve left the target slab at the tail.
        let tail = unsafe { &mut *self.tail };
        let base = ptr::from_mut(tail) as usize;
        let end = ptr.as_ptr() as usize + size - base;
        self.used += end - tail.used;
        tail.used = end;
        tail.max_id = tail.max_id.max(id);
        Some(ptr)
    }

    #[inline]
    pub fn alloc(&mut self, size: usize, id: u64) -> Option<NonNull<u8>> {
        self.aligned_alloc(size, 1, id)
    }

    /// Release every slab, oldest first, whose allocations all carry ids at
    /// or below `min_id`.
    pub fn gc(&mut self, min_id: u64) {
        while let Some(slab) = NonNull::new(self.head) {
            let slab = slab.as_ptr();
            // Safety: head is a live slab of this region.
            let (next, size, used, max_id) =
                unsafe { ((*slab).next, (*slab).size, (*slab).used, (*slab).max_id) };
            if max_id > min_id {
                break;
            }
            self.head = next;
            self.used -= used - HEADER;
            self.total -= size;
            self.release_slab(slab);
        }
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
    }

    fn release_slab(&mut self, slab: *mut SlabHeader) {
        if self.cached.is_null() {
            self.cached = slab;
            return;
        }
        // Safety: the slab came from this arena and is no longer linked.
        unsafe { self.arena.as_mut().unmap_slab(NonNull::new_unchecked(slab.cast::<u8>())) };
    }

    /// Bytes handed out, alignment padding included.
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes of the slabs currently holding allocations.
    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }

    /// Apply `mode` to every slab the region holds, the spare one included.
    ///
    /// # Safety
    ///
    /// `self` must be readable for the duration of the call.
    pub unsafe fn protect_slabs(&self, mode: Protection) {
        let page = pages::page_size();
        let mut cursor = self.head;
        while let Some(slab) = NonNull::new(cursor) {
            // Safety: region slabs are page aligned and owned by us; the
            // header page is readable before it is dereferenced.
            unsafe {
                protect_or_die(slab.cast(), page, Protection::Read);
                let (next, size) = ((*slab.as_ptr()).next, (*slab.as_ptr()).size);
                protect_or_die(slab.cast(), size, mode);
                cursor = next;
            }
        }
        if let Some(cached) = NonNull::new(self.cached) {
            // Safety: as above.
            unsafe {
                protect_or_die(cached.cast(), page, Protection::Read);
                let size = (*cached.as_ptr()).size;
                protect_or_die(cached.cast(), size, mode);
            }
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.gc(u64::MAX);
        if let Some(cached) = NonNull::new(self.cached) {
            self.cached = ptr::null_mut();
            // Safety: the spare slab came from this arena.
            unsafe { self.arena.as_mut().unmap_slab(cached.cast()) };
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("used", &self.used)
            .field("total", &self.total)
            .field("cached", &!self.cached.is_null())
            .finish_non_exhaustive()
    }
}
