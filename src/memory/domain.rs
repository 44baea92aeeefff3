//! Allocation domain: the call surface that stands in for an arena/region
//! library.
//!
//! A [`Domain`] owns at most one [`EpochQueue`]. Arena and region "objects"
//! handed to callers are the queue's guard-page handle; every call resolves
//! that handle under the domain lock, picks the current epoch and forwards
//! to its region allocator after the lock is released.

use std::ptr::NonNull;

use super::epoch::Epoch;
use super::fatal::die;
use super::guard::{Guarded, Handle};
use super::pages;
use super::queue::EpochQueue;
use super::vm::VmError;
use crate::config::{ArenaFlags, ArenaOptions, EpochPolicy};
use crate::sync::{Mutex, lock};

/// Stand-in for an arena pointer. Never dereference it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArenaHandle(Handle);

/// Stand-in for a region pointer. Shares the arena's handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegionHandle(Handle);

impl ArenaHandle {
    #[inline]
    #[must_use]
    pub fn handle(self) -> Handle {
        self.0
    }
}

impl RegionHandle {
    #[inline]
    #[must_use]
    pub fn handle(self) -> Handle {
        self.0
    }
}

struct DomainState {
    queue: Option<Guarded<EpochQueue>>,
}

pub struct Domain {
    policy: EpochPolicy,
    state: Mutex<DomainState>,
}

impl Default for Domain {
    fn default() -> Self {
        Self::new(EpochPolicy::default())
    }
}

impl Domain {
    #[must_use]
    pub fn new(policy: EpochPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(DomainState { queue: None }),
        }
    }

    #[inline]
    pub fn policy(&self) -> EpochPolicy {
        self.policy
    }

    /// Create the domain's epoch queue on first use and return its handle.
    ///
    /// Later calls return the same handle; their options are ignored.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the first epoch cannot be built (bad slab size,
    /// prealloc over quota, or the OS refusing the mapping).
    pub fn arena_create(
        &self,
        quota: usize,
        prealloc: usize,
        slab_size: usize,
        flags: ArenaFlags,
    ) -> Result<ArenaHandle, VmError> {
        let mut state = lock(&self.state);
        if let Some(queue) = &state.queue {
            tracing::trace!(handle = ?queue.handle(), "arena already created");
            return Ok(ArenaHandle(queue.handle()));
        }
        let options = ArenaOptions::new(quota, prealloc, slab_size, flags);
        let queue = EpochQueue::create(1, self.policy, options)?;
        let handle = queue.handle();
        state.queue = Some(queue);
        Ok(ArenaHandle(handle))
    }

    /// Epochs are only ever retired by `gc`.
    pub fn arena_destroy(&self, arena: ArenaHandle) {
        let state = lock(&self.state);
        Self::resolve(&state, arena.0);
        tracing::trace!(handle = ?arena.0, "arena destroy ignored");
    }

    pub fn region_create(&self, arena: ArenaHandle) -> RegionHandle {
        let state = lock(&self.state);
        // Safety: resolve checked that the queue is ours and alive.
        unsafe { Self::resolve(&state, arena.0).as_ref() }.current_epoch();
        RegionHandle(arena.0)
    }

    pub fn region_destroy(&self, region: RegionHandle) {
        let state = lock(&self.state);
        Self::resolve(&state, region.0);
        tracing::trace!(handle = ?region.0, "region destroy ignored");
    }

    /// The live queue behind `handle`, or abort.
    fn resolve(state: &DomainState, handle: Handle) -> NonNull<EpochQueue> {
        let Some(queue) = &state.queue else {
            die!("handle {handle:?} used before its arena was created");
        };
        if queue.handle() != handle {
            die!("handle {handle:?} does not belong to this domain");
        }
        // Safety: the handle is our own queue's, which is mapped until the
        // domain drops.
        unsafe { EpochQueue::resolve(handle) }
    }

    fn current_epoch(&self, region: RegionHandle) -> NonNull<Epoch> {
        let state = lock(&self.state);
        // Safety: resolve returned a live queue.
        unsafe { Self::resolve(&state, region.0).as_ref() }.current_epoch()
    }

    /// Where the next allocation of `size` bytes will land.
    ///
    /// Requests too large for a slab have nowhere to be reserved and return
    /// `None`.
    ///
    /// # Safety
    ///
    /// The region allocator is single-threaded and is driven outside the
    /// domain lock. While this call runs, no other thread may allocate from
    /// this domain or read its accounting through [`used`](Self::used) or
    /// [`total`](Self::total). The returned memory is only valid until the
    /// next `gc`.
    pub unsafe fn aligned_reserve(
        &self,
        region: RegionHandle,
        size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        let epoch = self.current_epoch(region);
        // Safety: the current epoch is read-write; exclusivity is upheld by
        // the caller.
        unsafe { (*epoch.as_ref().region()).aligned_reserve(size, align) }
    }

    /// # Safety
    ///
    /// See [`aligned_reserve`](Self::aligned_reserve).
    pub unsafe fn reserve(&self, region: RegionHandle, size: usize) -> Option<NonNull<u8>> {
        // Safety: upheld by caller.
        unsafe { self.aligned_reserve(region, size, 1) }
    }

    /// Allocate `size` bytes tagged with `id` in the current epoch.
    ///
    /// Requests larger than a slab get their own pages, released with the
    /// epoch. Returns `None` when memory runs out.
    ///
    /// # Safety
    ///
    /// See [`aligned_reserve`](Self::aligned_reserve).
    pub unsafe fn aligned_alloc(
        &self,
        region: RegionHandle,
        size: usize,
        align: usize,
        id: u64,
    ) -> Option<NonNull<u8>> {
        let state = lock(&self.state);
        // Safety: resolve returned a live queue.
        let mut epoch = unsafe { Self::resolve(&state, region.0).as_ref() }.current_epoch();
        // Safety: the current epoch is read-write.
        let max_payload = unsafe { (*epoch.as_ref().region()).max_payload(align) };
        if size > max_payload && align.is_power_of_two() {
            if align > pages::page_size() {
                return None;
            }
            // Safety: the epoch list is only changed under the lock we hold.
            return unsafe { epoch.as_mut() }.allocate_oversized(size);
        }
        drop(state);
        // Safety: the current epoch is read-write; exclusivity is upheld by
        // the caller.
        unsafe { (*epoch.as_ref().region()).aligned_alloc(size, align, id) }
    }

    /// # Safety
    ///
    /// See [`aligned_reserve`](Self::aligned_reserve).
    pub unsafe fn alloc(&self, region: RegionHandle, size: usize, id: u64) -> Option<NonNull<u8>> {
        // Safety: upheld by caller.
        unsafe { self.aligned_alloc(region, size, 1, id) }
    }

    /// Retire the current generation.
    ///
    /// `min_id` must equal [`position`](Self::position); any other value
    /// means the caller lost track of the window and the process aborts.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if a new epoch cannot be created; nothing changes in
    /// that case.
    ///
    /// # Safety
    ///
    /// Memory handed out before this call becomes read-only, then
    /// inaccessible, then reused over the following calls. Touching it in
    /// those states faults, which is the point.
    pub unsafe fn gc(&self, region: RegionHandle, min_id: u64) -> Result<(), VmError> {
        let state = lock(&self.state);
        let mut queue = Self::resolve(&state, region.0);
        // Safety: the queue is ours and only mutated under the lock.
        let queue = unsafe { queue.as_mut() };
        if queue.position() != min_id {
            die!(
                "gc watermark {min_id} does not match the current generation {}",
                queue.position()
            );
        }
        // Safety: upheld by caller.
        unsafe { queue.advance() }
    }

    /// Bytes allocated in the current epoch, oversized blocks included.
    ///
    /// Forwarded allocations update these counters outside the lock; the
    /// allocation functions' safety contract keeps the two apart.
    pub fn used(&self, region: RegionHandle) -> usize {
        let state = lock(&self.state);
        // Safety: resolve returned a live queue.
        let epoch = unsafe { Self::resolve(&state, region.0).as_ref() }.current_epoch();
        // Safety: the current epoch is readable while we hold the lock.
        unsafe { epoch.as_ref().used() }
    }

    /// Bytes held by the current epoch, oversized blocks included. Same
    /// caveat as [`used`](Self::used).
    pub fn total(&self, region: RegionHandle) -> usize {
        let state = lock(&self.state);
        // Safety: resolve returned a live queue.
        let epoch = unsafe { Self::resolve(&state, region.0).as_ref() }.current_epoch();
        // Safety: as above.
        unsafe { epoch.as_ref().total() }
    }

    /// The watermark the next `gc` call must pass.
    pub fn position(&self, region: RegionHandle) -> u64 {
        let state = lock(&self.state);
        // Safety: resolve returned a live queue.
        unsafe { Self::resolve(&state, region.0).as_ref() }.position()
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if let Some(queue) = state.queue.take() {
            tracing::info!(
                handle = ?queue.handle(),
                position = queue.position(),
                "domain shut down"
            );
        }
    }
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;
    use crate::config::ReleasePolicy;

    fn domain() -> Domain {
        Domain::new(EpochPolicy::default().with_release(ReleasePolicy::Unmap))
    }

    fn setup(domain: &Domain) -> RegionHandle {
        let arena = domain
            .arena_create(usize::MAX, 0, pages::page_size() * 4, ArenaFlags::Private)
            .unwrap();
        domain.region_create(arena)
    }

    #[test]
    fn test_arena_create_is_idempotent() {
        let domain = domain();
        let a = domain.arena_create(usize::MAX, 0, 1 << 16, ArenaFlags::Private).unwrap();
        let b = domain.arena_create(0, 0, 1, ArenaFlags::Shared).unwrap();
        assert_eq!(a, b);
        let region = domain.region_create(a);
        assert_eq!(region.handle(), a.handle());
        domain.region_destroy(region);
        domain.arena_destroy(a);
        assert_eq!(domain.position(region), 1);
    }

    #[test]
    fn test_arena_create_reports_bad_options() {
        let domain = domain();
        let err = domain.arena_create(usize::MAX, 0, 0, ArenaFlags::Private).unwrap_err();
        assert!(matches!(err, VmError::InvalidSlabSize { .. }));
        // nothing was created, a later valid call still works
        assert!(domain.arena_create(usize::MAX, 0, 1 << 16, ArenaFlags::Private).is_ok());
    }

    #[test]
    fn test_alloc_and_accounting() {
        let domain = domain();
        let region = setup(&domain);
        // Safety: Test code, single thread.
        unsafe {
            let reserved = domain.reserve(region, 100).unwrap();
            assert_eq!(domain.used(region), 0);
            let a = domain.alloc(region, 100, 1).unwrap();
            assert_eq!(reserved, a);
            let b = domain.aligned_alloc(region, 32, 64, 1).unwrap();
            assert_eq!(b.as_ptr() as usize % 64, 0);
            a.as_ptr().write_bytes(1, 100);
            b.as_ptr().write_bytes(2, 32);
        }
        assert!(domain.used(region) >= 132);
        assert_eq!(domain.total(region), pages::page_size() * 4);
    }

    #[test]
    fn test_oversized_goes_to_own_pages() {
        let domain = domain();
        let region = setup(&domain);
        let size = pages::page_size() * 10;
        // Safety: Test code.
        unsafe {
            assert!(domain.reserve(region, size).is_none());
            let p = domain.alloc(region, size, 1).unwrap();
            assert!(pages::is_page_aligned(p.as_ptr() as usize));
            p.as_ptr().add(size - 1).write(5);
        }
        assert_eq!(domain.used(region), size);
        assert_eq!(domain.total(region), size);
    }

    #[test]
    fn test_unmappable_request_returns_none() {
        let domain = domain();
        let region = setup(&domain);
        // Safety: Test code.
        unsafe {
            assert!(domain.alloc(region, usize::MAX - 10, 1).is_none());
            assert!(domain.aligned_alloc(region, usize::MAX - 10, 8, 1).is_none());
            assert!(domain.reserve(region, usize::MAX - 10).is_none());
            // the lock was released and the epoch is still usable
            assert!(domain.alloc(region, 64, 1).is_some());
        }
        assert!(domain.used(region) >= 64);
    }

    #[test]
    fn test_gc_advances_position() {
        let domain = domain();
        let region = setup(&domain);
        for expected in 2..12 {
            let position = domain.position(region);
            // Safety: Test code, nothing outstanding is touched.
            unsafe {
                domain.alloc(region, 64, position).unwrap();
                domain.gc(region, position).unwrap();
            }
            assert_eq!(domain.position(region), expected);
            assert_eq!(domain.used(region), 0);
        }
    }

    #[test]
    fn test_independent_domains() {
        let first = domain();
        let second = domain();
        let a = setup(&first);
        let b = setup(&second);
        assert_ne!(a, b);
        // Safety: Test code.
        unsafe { first.gc(a, 1).unwrap() };
        assert_eq!(first.position(a), 2);
        assert_eq!(second.position(b), 1);
    }

    #[test]
    fn test_accounting_serialised_with_allocation() {
        let domain = std::sync::Arc::new(domain());
        let region = setup(&domain);
        let exclusive = std::sync::Arc::new(std::sync::Mutex::new(()));
        let workers: Vec<_> = (0..4u64)
            .map(|id| {
                let domain = std::sync::Arc::clone(&domain);
                let exclusive = std::sync::Arc::clone(&exclusive);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        let _turn = exclusive.lock().unwrap();
                        let before = domain.used(region);
                        // Safety: Test code, allocation and accounting are
                        // serialised by `exclusive`.
                        unsafe { domain.alloc(region, 16, id + 1).unwrap() };
                        assert!(domain.used(region) >= before + 16);
                        assert!(domain.used(region) <= domain.total(region));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(domain.used(region) >= 4 * 25 * 16);
    }

    #[test]
    fn test_shared_across_threads() {
        let domain = std::sync::Arc::new(domain());
        let region = setup(&domain);
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let domain = std::sync::Arc::clone(&domain);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        assert!(domain.used(region) <= domain.total(region));
                        assert!(domain.position(region) >= 1);
                    }
                })
            })
            .collect();
        for _ in 0..20 {
            let position = domain.position(region);
            // Safety: Test code, no allocations outstanding.
            unsafe { domain.gc(region, position).unwrap() };
        }
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(domain.position(region), 21);
    }
}
